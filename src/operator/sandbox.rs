//! Sandbox reconciler.
//!
//! Drives Pending -> Bound -> Ready (or Failed), binding each Sandbox to
//! exactly one idle pod. The claim is a compare-and-swap on the pod's
//! labels: the patch carries the observed resourceVersion, so of any number
//! of racing controllers exactly one wins and the rest move to the next
//! candidate. The deletion finalizer returns or destroys the pod.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{
    validate_transition, Condition, Sandbox, SandboxPhase, SandboxStatus, WarmPool,
    POD_STATE_ALLOCATED, POD_STATE_LABEL, POD_STATE_READY, POOL_LABEL, SANDBOX_FINALIZER,
    SANDBOX_LABEL,
};
use crate::error::{Error, Result};
use crate::metrics::{NO_IDLE_PODS, RECONCILE_TOTAL, SANDBOX_IDLE_SECONDS, SANDBOX_READY_DURATION};
use crate::operator::pool::{fatal_waiting_reason, pod_is_ready};
use crate::operator::Context;

const ERROR_REQUEUE: std::time::Duration = std::time::Duration::from_secs(10);
/// A Ready sandbox tolerates a not-Ready pod for this long before failing.
const READY_LOSS_GRACE_SECONDS: i64 = 30;

const CONDITION_POD_HEALTHY: &str = "PodHealthy";

pub async fn run(client: Client, ctx: Arc<Context>, shutdown: CancellationToken) {
    let sandboxes: Api<Sandbox> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    // Pods are owned by pools, not sandboxes; map pod events back through
    // the `sandbox` label instead of owner references.
    Controller::new(sandboxes, watcher::Config::default())
        .watches(pods, watcher::Config::default(), |pod: Pod| {
            let namespace = pod.namespace();
            pod.labels()
                .get(SANDBOX_LABEL)
                .map(|name| ObjectRef::new(name).within(namespace.as_deref().unwrap_or("default")))
                .into_iter()
        })
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((sandbox, _)) => debug!(sandbox = %sandbox.name, "sandbox reconciled"),
                Err(e) => warn!(error = %e, "sandbox reconcile failed"),
            }
        })
        .await;
}

fn error_policy(_sandbox: Arc<Sandbox>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "sandbox reconcile error, requeueing");
    metrics::counter!(RECONCILE_TOTAL, "controller" => "sandbox", "outcome" => "error")
        .increment(1);
    Action::requeue(ERROR_REQUEUE)
}

struct Apis {
    sandboxes: Api<Sandbox>,
    pods: Api<Pod>,
    pools: Api<WarmPool>,
}

async fn reconcile(sandbox: Arc<Sandbox>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = sandbox
        .namespace()
        .ok_or_else(|| Error::InvalidArgument("Sandbox must be namespaced".to_string()))?;
    let apis = Apis {
        sandboxes: Api::namespaced(ctx.client.clone(), &namespace),
        pods: Api::namespaced(ctx.client.clone(), &namespace),
        pools: Api::namespaced(ctx.client.clone(), &namespace),
    };

    if sandbox.metadata.deletion_timestamp.is_some() {
        finalize(&apis, &sandbox, &ctx).await?;
        return Ok(Action::await_change());
    }

    ensure_finalizer(&apis, &sandbox).await?;

    let action = match sandbox.phase() {
        None => {
            set_phase(&apis, &sandbox, SandboxPhase::Pending, None, &ctx).await?;
            Action::requeue(ctx.settings.sandbox_resync)
        }
        Some(SandboxPhase::Pending) => reconcile_pending(&apis, &sandbox, &ctx).await?,
        Some(SandboxPhase::Bound) => reconcile_bound(&apis, &sandbox, &ctx).await?,
        Some(SandboxPhase::Ready) => reconcile_ready(&apis, &sandbox, &ctx).await?,
        Some(SandboxPhase::Failed) => Action::await_change(),
    };

    metrics::counter!(RECONCILE_TOTAL, "controller" => "sandbox", "outcome" => "ok").increment(1);
    Ok(action)
}

async fn reconcile_pending(apis: &Apis, sandbox: &Sandbox, ctx: &Context) -> Result<Action> {
    let pool = match apis.pools.get_opt(&sandbox.spec.pool_ref).await? {
        Some(pool) => pool,
        None => {
            // The pool may simply not exist yet; only persistent absence
            // plus exhausted attempts is terminal.
            let attempts = bump_bind_attempts(apis, sandbox).await?;
            if attempts > ctx.settings.sandbox_bind_max_attempts {
                fail(
                    apis,
                    sandbox,
                    &format!(
                        "pool {} not found after {attempts} bind attempts",
                        sandbox.spec.pool_ref
                    ),
                    ctx,
                )
                .await?;
                return Ok(Action::await_change());
            }
            return Ok(Action::requeue(ctx.settings.sandbox_resync));
        }
    };

    if let Some(reason) = pool.unhealthy_reason() {
        fail(apis, sandbox, &reason, ctx).await?;
        return Ok(Action::await_change());
    }

    match claim_pod(apis, sandbox).await? {
        Some(pod) => {
            let work_dir = pool
                .spec
                .template
                .workspace_dir
                .clone()
                .unwrap_or_else(|| ctx.settings.workspace_dir.clone());
            let status = SandboxStatus {
                phase: SandboxPhase::Bound,
                pod_name: Some(pod.name_any()),
                pod_ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
                work_dir: Some(work_dir),
                conditions: vec![Condition::new(
                    "Bound",
                    true,
                    None,
                    Some(&format!("bound to pod {}", pod.name_any())),
                    ctx.clock.now(),
                )],
                ..Default::default()
            };
            write_status(apis, sandbox, status).await?;
            info!(sandbox = %sandbox.name_any(), pod = %pod.name_any(), "sandbox bound");
            Ok(Action::requeue(ctx.settings.sandbox_resync))
        }
        None => {
            metrics::counter!(NO_IDLE_PODS, "pool" => sandbox.spec.pool_ref.clone()).increment(1);
            let attempts = bump_bind_attempts(apis, sandbox).await?;
            if attempts > ctx.settings.sandbox_bind_max_attempts {
                fail(
                    apis,
                    sandbox,
                    &format!(
                        "no idle pod in pool {} after {attempts} attempts ({})",
                        sandbox.spec.pool_ref,
                        pool.diagnosis()
                    ),
                    ctx,
                )
                .await?;
                return Ok(Action::await_change());
            }
            Ok(Action::requeue(ctx.settings.sandbox_resync))
        }
    }
}

async fn reconcile_bound(apis: &Apis, sandbox: &Sandbox, ctx: &Context) -> Result<Action> {
    let Some(pod_name) = sandbox.status.as_ref().and_then(|s| s.pod_name.clone()) else {
        fail(apis, sandbox, "Bound sandbox lost its pod name", ctx).await?;
        return Ok(Action::await_change());
    };
    let pod = match apis.pods.get_opt(&pod_name).await? {
        Some(pod) => pod,
        None => {
            fail(apis, sandbox, &format!("bound pod {pod_name} vanished"), ctx).await?;
            return Ok(Action::await_change());
        }
    };
    if let Some(reason) = fatal_waiting_reason(&pod) {
        fail(
            apis,
            sandbox,
            &format!("bound pod {pod_name} failed before Ready: {reason}"),
            ctx,
        )
        .await?;
        return Ok(Action::await_change());
    }

    if pod_is_ready(&pod) {
        if let Some(created) = sandbox.metadata.creation_timestamp.as_ref() {
            let elapsed = (ctx.clock.now() - created.0).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::histogram!(SANDBOX_READY_DURATION).record(elapsed);
        }
        // The pod IP can land after binding; refresh it on promotion.
        let mut status = sandbox.status.clone().unwrap_or_default();
        status.phase = SandboxPhase::Ready;
        status.pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
        write_status(apis, sandbox, status).await?;
        info!(sandbox = %sandbox.name_any(), "sandbox ready");
    }
    Ok(Action::requeue(ctx.settings.sandbox_resync))
}

async fn reconcile_ready(apis: &Apis, sandbox: &Sandbox, ctx: &Context) -> Result<Action> {
    let now = ctx.clock.now();
    let pod_name = sandbox
        .status
        .as_ref()
        .and_then(|s| s.pod_name.clone())
        .unwrap_or_default();
    let pod = apis.pods.get_opt(&pod_name).await?;

    let healthy = pod.as_ref().map(pod_is_ready).unwrap_or(false);
    if !healthy {
        if pod.is_none() {
            fail(apis, sandbox, &format!("pod {pod_name} was deleted"), ctx).await?;
            return Ok(Action::await_change());
        }
        // Tolerate a Ready blip up to the grace window.
        let since = sandbox
            .status
            .as_ref()
            .and_then(|s| crate::crd::find_condition(&s.conditions, CONDITION_POD_HEALTHY))
            .filter(|c| !c.is_true())
            .and_then(|c| c.last_transition_time.as_deref())
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&chrono::Utc));
        match since {
            Some(since) if (now - since).num_seconds() >= READY_LOSS_GRACE_SECONDS => {
                fail(
                    apis,
                    sandbox,
                    &format!("pod {pod_name} lost Ready for over {READY_LOSS_GRACE_SECONDS}s"),
                    ctx,
                )
                .await?;
                return Ok(Action::await_change());
            }
            Some(_) => {}
            None => {
                let mut status = sandbox.status.clone().unwrap_or_default();
                status
                    .conditions
                    .retain(|c| c.type_ != CONDITION_POD_HEALTHY);
                status.conditions.push(Condition::new(
                    CONDITION_POD_HEALTHY,
                    false,
                    Some("PodNotReady"),
                    Some(&format!("pod {pod_name} is not Ready")),
                    now,
                ));
                write_status(apis, sandbox, status).await?;
            }
        }
        return Ok(Action::requeue(ctx.settings.sandbox_resync));
    }

    // Healthy again: clear the blip marker if one is set.
    if sandbox
        .status
        .as_ref()
        .map(|s| {
            crate::crd::find_condition(&s.conditions, CONDITION_POD_HEALTHY)
                .map(|c| !c.is_true())
                .unwrap_or(false)
        })
        .unwrap_or(false)
    {
        let mut status = sandbox.status.clone().unwrap_or_default();
        status
            .conditions
            .retain(|c| c.type_ != CONDITION_POD_HEALTHY);
        write_status(apis, sandbox, status).await?;
    }

    // Idle reclamation.
    let idle_timeout = sandbox
        .effective_idle_timeout(ctx.settings.sandbox_idle_timeout.as_secs() as i64);
    if idle_timeout > 0 {
        if let Some(deadline_base) = idle_base(sandbox) {
            let idle_for = (now - deadline_base).num_seconds();
            if idle_for >= idle_timeout {
                info!(
                    sandbox = %sandbox.name_any(),
                    idle_seconds = idle_for,
                    "reclaiming idle sandbox"
                );
                metrics::histogram!(SANDBOX_IDLE_SECONDS).record(idle_for as f64);
                apis.sandboxes
                    .delete(&sandbox.name_any(), &DeleteParams::default())
                    .await?;
                return Ok(Action::await_change());
            }
        }
    }

    Ok(Action::requeue(ctx.settings.sandbox_resync))
}

/// The idle clock starts at the later of creation and the last execute.
pub fn idle_base(sandbox: &Sandbox) -> Option<chrono::DateTime<chrono::Utc>> {
    let created = sandbox.metadata.creation_timestamp.as_ref().map(|t| t.0);
    match (sandbox.last_task_time(), created) {
        (Some(task), Some(created)) => Some(task.max(created)),
        (Some(task), None) => Some(task),
        (None, created) => created,
    }
}

/// Try to claim one idle pod for this sandbox. Candidates are shuffled so
/// racing controllers spread over different pods, and each patch carries the
/// observed resourceVersion: a 409 means we lost that candidate.
async fn claim_pod(apis: &Apis, sandbox: &Sandbox) -> Result<Option<Pod>> {
    let selector = format!(
        "{POOL_LABEL}={},{POD_STATE_LABEL}={POD_STATE_READY}",
        sandbox.spec.pool_ref
    );
    let mut candidates: Vec<Pod> = apis
        .pods
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .into_iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none() && pod_is_ready(pod))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());

    for candidate in candidates {
        let pod_name = candidate.name_any();
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": candidate.resource_version(),
                "labels": {
                    POD_STATE_LABEL: POD_STATE_ALLOCATED,
                    SANDBOX_LABEL: sandbox.name_any(),
                }
            }
        });
        match apis
            .pods
            .patch(&pod_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(pod) => return Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(pod = %pod_name, "lost claim race, trying next candidate");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

/// Finalizer body: return the pod to the pool or destroy it, then release
/// the finalizer.
async fn finalize(apis: &Apis, sandbox: &Sandbox, _ctx: &Context) -> Result<()> {
    if !sandbox
        .finalizers()
        .iter()
        .any(|f| f == SANDBOX_FINALIZER)
    {
        return Ok(());
    }

    if let Some(pod_name) = sandbox.status.as_ref().and_then(|s| s.pod_name.as_deref()) {
        let pod = apis.pods.get_opt(pod_name).await?;
        match pod {
            Some(pod) if sandbox.spec.keep_alive && pod_is_ready(&pod) => {
                // Healthy keep-alive pod: back into the idle pool.
                let patch = serde_json::json!({
                    "metadata": {
                        "labels": {
                            POD_STATE_LABEL: POD_STATE_READY,
                            SANDBOX_LABEL: null,
                        }
                    }
                });
                apis.pods
                    .patch(pod_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                info!(pod = pod_name, "pod returned to pool");
            }
            Some(_) => {
                match apis.pods.delete(pod_name, &DeleteParams::default()).await {
                    Ok(_) => info!(pod = pod_name, "pod deleted, pool will replace it"),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
            None => {}
        }
    }

    let remaining: Vec<String> = sandbox
        .finalizers()
        .iter()
        .filter(|f| *f != SANDBOX_FINALIZER)
        .cloned()
        .collect();
    apis.sandboxes
        .patch(
            &sandbox.name_any(),
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": remaining } })),
        )
        .await?;
    Ok(())
}

async fn ensure_finalizer(apis: &Apis, sandbox: &Sandbox) -> Result<()> {
    if sandbox
        .finalizers()
        .iter()
        .any(|f| f == SANDBOX_FINALIZER)
    {
        return Ok(());
    }
    let mut finalizers = sandbox.finalizers().to_vec();
    finalizers.push(SANDBOX_FINALIZER.to_string());
    apis.sandboxes
        .patch(
            &sandbox.name_any(),
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
    Ok(())
}

async fn bump_bind_attempts(apis: &Apis, sandbox: &Sandbox) -> Result<i64> {
    let attempts = sandbox
        .status
        .as_ref()
        .map(|s| s.bind_attempts)
        .unwrap_or(0)
        + 1;
    let mut status = sandbox.status.clone().unwrap_or_default();
    status.bind_attempts = attempts;
    write_status(apis, sandbox, status).await?;
    Ok(attempts)
}

async fn fail(apis: &Apis, sandbox: &Sandbox, message: &str, ctx: &Context) -> Result<()> {
    warn!(sandbox = %sandbox.name_any(), message, "sandbox failed");
    let mut status = sandbox.status.clone().unwrap_or_default();
    status.phase = SandboxPhase::Failed;
    status.conditions.push(Condition::new(
        "Failed",
        true,
        Some("SandboxFailed"),
        Some(message),
        ctx.clock.now(),
    ));
    write_status(apis, sandbox, status).await
}

/// Every status write passes the transition validator. A write that the
/// graph rejects forces the sandbox to Failed instead of corrupting the
/// lifecycle.
async fn write_status(apis: &Apis, sandbox: &Sandbox, mut status: SandboxStatus) -> Result<()> {
    if let Err(e) = validate_transition(sandbox.phase(), status.phase) {
        warn!(sandbox = %sandbox.name_any(), error = %e, "illegal transition forced to Failed");
        status.phase = SandboxPhase::Failed;
        status.conditions.push(Condition::new(
            "Failed",
            true,
            Some("IllegalTransition"),
            Some(&e.to_string()),
            chrono::Utc::now(),
        ));
    }
    apis.sandboxes
        .patch_status(
            &sandbox.name_any(),
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
    Ok(())
}

async fn set_phase(
    apis: &Apis,
    sandbox: &Sandbox,
    phase: SandboxPhase,
    message: Option<&str>,
    ctx: &Context,
) -> Result<()> {
    let mut status = sandbox.status.clone().unwrap_or_default();
    status.phase = phase;
    if let Some(message) = message {
        status.conditions.push(Condition::new(
            &phase.to_string(),
            true,
            None,
            Some(message),
            ctx.clock.now(),
        ));
    }
    write_status(apis, sandbox, status).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SandboxSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn sandbox(created_secs_ago: i64, last_task_secs_ago: Option<i64>) -> Sandbox {
        let now = chrono::Utc::now();
        let mut sandbox = Sandbox::new(
            "s1",
            SandboxSpec {
                pool_ref: "p1".into(),
                keep_alive: true,
                idle_timeout_seconds: Some(60),
                resources: None,
            },
        );
        sandbox.metadata.creation_timestamp =
            Some(Time(now - chrono::Duration::seconds(created_secs_ago)));
        sandbox.status = Some(SandboxStatus {
            phase: SandboxPhase::Ready,
            last_task_time: last_task_secs_ago
                .map(|secs| (now - chrono::Duration::seconds(secs)).to_rfc3339()),
            ..Default::default()
        });
        sandbox
    }

    #[test]
    fn idle_base_is_the_later_of_create_and_last_task() {
        let fresh_task = sandbox(600, Some(10));
        let base = idle_base(&fresh_task).unwrap();
        let age = (chrono::Utc::now() - base).num_seconds();
        assert!((9..=11).contains(&age), "age {age}");

        let never_touched = sandbox(600, None);
        let base = idle_base(&never_touched).unwrap();
        let age = (chrono::Utc::now() - base).num_seconds();
        assert!((599..=601).contains(&age), "age {age}");

        // A stale lastTaskTime older than creation does not resurrect idleness.
        let stale_task = sandbox(30, Some(600));
        let base = idle_base(&stale_task).unwrap();
        let age = (chrono::Utc::now() - base).num_seconds();
        assert!((29..=31).contains(&age), "age {age}");
    }
}

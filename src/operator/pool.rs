//! WarmPool reconciler.
//!
//! Level-triggered: every pass lists the pool's pods, partitions them,
//! creates or deletes pods to converge on `spec.replicas` idle pods, and
//! derives status conditions. Pods stuck pulling images are never counted
//! as healthy pending; they surface through `PodsFailing` so sandbox
//! creation can fail fast.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{
    Condition, WarmPool, WarmPoolStatus, CONDITION_PODS_FAILING, CONDITION_READY,
    POD_STATE_ALLOCATED, POD_STATE_LABEL, POD_STATE_READY, POOL_LABEL,
};
use crate::error::{Error, Result};
use crate::metrics::{
    IMAGE_PULL_ERRORS, POD_READY_DURATION, POOL_ALLOCATED_REPLICAS, POOL_READY_REPLICAS,
    RECONCILE_TOTAL,
};
use crate::operator::podspec;
use crate::operator::Context;

const RESYNC_INTERVAL: Duration = Duration::from_secs(30);
const ERROR_REQUEUE: Duration = Duration::from_secs(10);

/// Marks pods whose creation-to-ready latency was already recorded.
const READY_OBSERVED_ANNOTATION: &str = "arl.dev/ready-observed";
/// Marks pods whose image-pull failure was already counted.
const PULL_ERROR_ANNOTATION: &str = "arl.dev/pull-error-observed";

/// Waiting reasons that count a pod as failing rather than pending.
const FATAL_WAITING: &[&str] = &["ImagePullBackOff", "ErrImagePull", "CrashLoopBackOff"];

pub async fn run(client: Client, ctx: Arc<Context>, shutdown: CancellationToken) {
    let pools: Api<WarmPool> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    Controller::new(pools, watcher::Config::default())
        .owns(pods, watcher::Config::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((pool, _)) => debug!(pool = %pool.name, "warmpool reconciled"),
                Err(e) => warn!(error = %e, "warmpool reconcile failed"),
            }
        })
        .await;
}

fn error_policy(_pool: Arc<WarmPool>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "warmpool reconcile error, requeueing");
    metrics::counter!(RECONCILE_TOTAL, "controller" => "warmpool", "outcome" => "error")
        .increment(1);
    Action::requeue(ERROR_REQUEUE)
}

/// Is the pod's Ready condition True?
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// First fatal waiting reason across init and main containers, if any.
pub fn fatal_waiting_reason(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    let statuses = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    for container in statuses {
        if let Some(reason) = container
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
        {
            if FATAL_WAITING.contains(&reason) {
                return Some(format!("{}: {reason}", container.name));
            }
        }
    }
    None
}

#[derive(Debug, Default)]
pub struct PodPartition {
    pub ready_idle: Vec<Pod>,
    pub allocated: Vec<Pod>,
    pub pending: Vec<Pod>,
    /// (pod name, reason)
    pub failing: Vec<(String, String)>,
}

impl PodPartition {
    /// Pods that count toward the desired population.
    pub fn healthy_total(&self) -> i32 {
        (self.ready_idle.len() + self.allocated.len() + self.pending.len()) as i32
    }
}

pub fn partition_pods(pods: Vec<Pod>) -> PodPartition {
    let mut partition = PodPartition::default();
    for pod in pods {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        if let Some(reason) = fatal_waiting_reason(&pod) {
            partition.failing.push((pod.name_any(), reason));
            continue;
        }
        let state = pod
            .labels()
            .get(POD_STATE_LABEL)
            .map(String::as_str)
            .unwrap_or(POD_STATE_READY);
        if state == POD_STATE_ALLOCATED {
            partition.allocated.push(pod);
        } else if pod_is_ready(&pod) {
            partition.ready_idle.push(pod);
        } else {
            partition.pending.push(pod);
        }
    }
    partition
}

/// Nodes already holding the executor image: nodes of this pool's pods whose
/// executor container has started. Capped at the locality budget `k`,
/// deterministically.
pub fn warm_image_nodes(pods: &PodPartition, k: usize) -> Vec<String> {
    if k == 0 {
        return Vec::new();
    }
    let mut nodes = BTreeSet::new();
    let all = pods
        .ready_idle
        .iter()
        .chain(pods.allocated.iter())
        .chain(pods.pending.iter());
    for pod in all {
        let pulled = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses.iter().any(|c| {
                    c.name == "executor"
                        && c.state
                            .as_ref()
                            .map(|s| s.running.is_some() || s.terminated.is_some())
                            .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        if pulled {
            if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                nodes.insert(node);
            }
        }
    }
    nodes.into_iter().take(k).collect()
}

/// Conditions derived from one pass. Timestamps are filled by the caller.
pub fn derive_conditions(
    replicas: i32,
    partition: &PodPartition,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<Condition> {
    let ready = partition.ready_idle.len() as i32 >= replicas;
    let mut conditions = vec![Condition::new(
        CONDITION_READY,
        ready,
        None,
        Some(&format!(
            "{}/{replicas} idle pods ready",
            partition.ready_idle.len()
        )),
        now,
    )];
    match partition.failing.first() {
        Some((pod, reason)) => conditions.push(Condition::new(
            CONDITION_PODS_FAILING,
            true,
            Some("PodFailing"),
            Some(&format!("pod {pod} is failing: {reason}")),
            now,
        )),
        None => conditions.push(Condition::new(CONDITION_PODS_FAILING, false, None, None, now)),
    }
    conditions
}

/// Compare statuses ignoring condition timestamps, so a convergent pass
/// writes nothing.
pub fn status_equal(a: &WarmPoolStatus, b: &WarmPoolStatus) -> bool {
    let key = |status: &WarmPoolStatus| {
        (
            status.ready_replicas,
            status.allocated_replicas,
            status
                .conditions
                .iter()
                .map(|c| (c.type_.clone(), c.status.clone(), c.message.clone()))
                .collect::<Vec<_>>(),
        )
    };
    key(a) == key(b)
}

async fn reconcile(pool: Arc<WarmPool>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = pool
        .namespace()
        .ok_or_else(|| Error::InvalidArgument("WarmPool must be namespaced".to_string()))?;
    let name = pool.name_any();

    if pool.metadata.deletion_timestamp.is_some() {
        // Owned pods are garbage-collected through their owner references.
        return Ok(Action::await_change());
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let pools: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &namespace);

    let listed = pods
        .list(&ListParams::default().labels(&format!("{POOL_LABEL}={name}")))
        .await?;
    let partition = partition_pods(listed.items);

    observe_pod_latencies(&pods, &partition, &name, &ctx).await;

    // Inline tool files live in a pool-owned ConfigMap.
    if let Some(configmap) = podspec::inline_tools_configmap(&pool) {
        let configmaps: Api<k8s_openapi::api::core::v1::ConfigMap> =
            Api::namespaced(ctx.client.clone(), &namespace);
        let cm_name = configmap.metadata.name.clone().unwrap_or_default();
        configmaps
            .patch(
                &cm_name,
                &PatchParams::apply("arl-operator"),
                &Patch::Apply(&configmap),
            )
            .await?;
    }

    let needed = pool.spec.replicas - partition.healthy_total();
    if needed > 0 {
        let locality_budget = pool
            .spec
            .image_locality
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| l.node_budget(pool.spec.replicas))
            .unwrap_or(0);
        let nodes = warm_image_nodes(&partition, locality_budget);
        let pod = podspec::build_pod(&pool, &ctx.settings, &nodes)?;
        for _ in 0..needed {
            pods.create(&PostParams::default(), &pod).await?;
        }
        info!(pool = %name, created = needed, "scaled pool up");
    } else if needed < 0 {
        // Only idle pods are eligible for downscale, oldest first.
        let mut idle = partition.ready_idle.clone();
        idle.sort_by_key(|pod| pod.metadata.creation_timestamp.clone());
        for pod in idle.iter().take((-needed) as usize) {
            pods.delete(&pod.name_any(), &DeleteParams::default()).await?;
        }
        info!(pool = %name, deleted = -needed, "scaled pool down");
    }

    let status = WarmPoolStatus {
        ready_replicas: partition.ready_idle.len() as i32,
        allocated_replicas: partition.allocated.len() as i32,
        conditions: derive_conditions(pool.spec.replicas, &partition, ctx.clock.now()),
    };
    metrics::gauge!(POOL_READY_REPLICAS, "pool" => name.clone())
        .set(status.ready_replicas as f64);
    metrics::gauge!(POOL_ALLOCATED_REPLICAS, "pool" => name.clone())
        .set(status.allocated_replicas as f64);

    let unchanged = pool
        .status
        .as_ref()
        .map(|current| status_equal(current, &status))
        .unwrap_or(false);
    if !unchanged {
        pools
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "status": status })),
            )
            .await?;
    }

    metrics::counter!(RECONCILE_TOTAL, "controller" => "warmpool", "outcome" => "ok").increment(1);
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Record creation-to-ready latency per node and newly observed image-pull
/// failures, deduplicated with pod annotations.
async fn observe_pod_latencies(
    pods: &Api<Pod>,
    partition: &PodPartition,
    pool_name: &str,
    ctx: &Context,
) {
    for pod in partition.ready_idle.iter().chain(partition.allocated.iter()) {
        if pod.annotations().contains_key(READY_OBSERVED_ANNOTATION) {
            continue;
        }
        if let Some(created) = pod.metadata.creation_timestamp.as_ref() {
            let elapsed = (ctx.clock.now() - created.0).num_milliseconds().max(0) as f64 / 1000.0;
            let node = pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            metrics::histogram!(POD_READY_DURATION, "node" => node).record(elapsed);
        }
        annotate(pods, &pod.name_any(), READY_OBSERVED_ANNOTATION).await;
    }

    for (pod_name, reason) in &partition.failing {
        if !reason.contains("ImagePull") {
            continue;
        }
        match pods.get_opt(pod_name).await {
            Ok(Some(pod)) if !pod.annotations().contains_key(PULL_ERROR_ANNOTATION) => {
                metrics::counter!(IMAGE_PULL_ERRORS, "pool" => pool_name.to_string()).increment(1);
                annotate(pods, pod_name, PULL_ERROR_ANNOTATION).await;
            }
            _ => {}
        }
    }
}

async fn annotate(pods: &Api<Pod>, pod_name: &str, annotation: &str) {
    let patch = serde_json::json!({
        "metadata": { "annotations": { annotation: "true" } }
    });
    if let Err(e) = pods
        .patch(pod_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        debug!(pod = pod_name, error = %e, "annotation patch failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::find_condition;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, PodCondition,
        PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str, state: &str, ready: bool, waiting_reason: Option<&str>) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(POOL_LABEL.to_string(), "p1".to_string());
        labels.insert(POD_STATE_LABEL.to_string(), state.to_string());

        let container_status = ContainerStatus {
            name: "executor".to_string(),
            ready,
            state: Some(match waiting_reason {
                Some(reason) => ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some(reason.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                None => ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                },
            }),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(format!("node-{name}")),
                containers: Vec::new(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![container_status]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn partition_separates_the_four_classes() {
        let partition = partition_pods(vec![
            pod("idle", POD_STATE_READY, true, None),
            pod("bound", POD_STATE_ALLOCATED, true, None),
            pod("starting", POD_STATE_READY, false, None),
            pod("stuck", POD_STATE_READY, false, Some("ImagePullBackOff")),
            pod("crashing", POD_STATE_READY, false, Some("CrashLoopBackOff")),
        ]);
        assert_eq!(partition.ready_idle.len(), 1);
        assert_eq!(partition.allocated.len(), 1);
        assert_eq!(partition.pending.len(), 1);
        assert_eq!(partition.failing.len(), 2);
        // Failing pods never count toward the healthy population.
        assert_eq!(partition.healthy_total(), 3);
    }

    #[test]
    fn fatal_waiting_ignores_normal_startup() {
        let starting = pod("s", POD_STATE_READY, false, Some("ContainerCreating"));
        assert!(fatal_waiting_reason(&starting).is_none());
        let stuck = pod("s", POD_STATE_READY, false, Some("ErrImagePull"));
        assert_eq!(
            fatal_waiting_reason(&stuck).as_deref(),
            Some("executor: ErrImagePull")
        );
    }

    #[test]
    fn warm_image_nodes_caps_at_the_budget() {
        let partition = partition_pods(vec![
            pod("a", POD_STATE_READY, true, None),
            pod("b", POD_STATE_READY, true, None),
            pod("c", POD_STATE_ALLOCATED, true, None),
        ]);
        let nodes = warm_image_nodes(&partition, 2);
        assert_eq!(nodes.len(), 2);
        assert_eq!(warm_image_nodes(&partition, 0), Vec::<String>::new());
        // Deterministic: sorted node names.
        assert_eq!(nodes, ["node-a", "node-b"]);
    }

    #[test]
    fn conditions_surface_failing_pods() {
        let now = chrono::Utc::now();
        let partition = partition_pods(vec![
            pod("idle", POD_STATE_READY, true, None),
            pod("stuck", POD_STATE_READY, false, Some("ImagePullBackOff")),
        ]);
        let conditions = derive_conditions(2, &partition, now);

        let ready = find_condition(&conditions, CONDITION_READY).unwrap();
        assert!(!ready.is_true(), "1/2 ready pods is not Ready");

        let failing = find_condition(&conditions, CONDITION_PODS_FAILING).unwrap();
        assert!(failing.is_true());
        assert!(failing.message.as_deref().unwrap().contains("stuck"));
        assert!(failing.message.as_deref().unwrap().contains("ImagePullBackOff"));
    }

    #[test]
    fn status_comparison_ignores_timestamps() {
        let now = chrono::Utc::now();
        let partition = partition_pods(vec![pod("idle", POD_STATE_READY, true, None)]);
        let a = WarmPoolStatus {
            ready_replicas: 1,
            allocated_replicas: 0,
            conditions: derive_conditions(1, &partition, now),
        };
        let b = WarmPoolStatus {
            ready_replicas: 1,
            allocated_replicas: 0,
            conditions: derive_conditions(1, &partition, now + chrono::Duration::seconds(60)),
        };
        assert!(status_equal(&a, &b));

        let c = WarmPoolStatus {
            ready_replicas: 0,
            ..a.clone()
        };
        assert!(!status_equal(&a, &c));
    }
}

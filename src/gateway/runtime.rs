//! Session runtime: the stateful control plane behind the HTTP surface.
//!
//! All cluster access goes through `ClusterBackend` and all pod access
//! through `SidecarClient`, so every path in here is exercised by tests
//! against in-memory implementations.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Settings;
use crate::crd::{
    is_dns_label, PoolTemplate, ResourceSpec, Sandbox, SandboxPhase, SandboxSpec, SandboxStatus,
    ToolSource, WarmPool, WarmPoolSpec,
};
use crate::error::{Error, Result};
use crate::gateway::backend::ClusterBackend;
use crate::gateway::session::{
    Session, SessionInfo, SessionMeta, SessionRegistry, StepRecord, StepRequest,
};
use crate::gateway::sidecar_client::{ExecSpec, SidecarClient};
use crate::metrics::{RESTORE_DURATION, RESTORE_TOTAL, STEP_DURATION, STEP_TOTAL};
use crate::rpc::CommandOutput;
use crate::trajectory::{TrajectoryEntry, TrajectoryWriter};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Pool health is re-checked every this many ready polls (~2.5s).
const HEALTH_CHECK_EVERY: u32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub results: Vec<StepRecord>,
    #[serde(rename = "totalDurationMs")]
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub allocated_replicas: i32,
    pub image: String,
}

pub struct SessionRuntime {
    backend: Arc<dyn ClusterBackend>,
    sidecar: Arc<dyn SidecarClient>,
    clock: Arc<dyn Clock>,
    trajectory: TrajectoryWriter,
    registry: SessionRegistry,
    settings: Settings,
}

impl SessionRuntime {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        sidecar: Arc<dyn SidecarClient>,
        clock: Arc<dyn Clock>,
        trajectory: TrajectoryWriter,
        settings: Settings,
    ) -> Self {
        Self {
            backend,
            sidecar,
            clock,
            trajectory,
            registry: SessionRegistry::new(),
            settings,
        }
    }

    // ===== Session lifecycle =====

    pub async fn create_session(
        &self,
        pool_ref: &str,
        namespace: Option<&str>,
        keep_alive: bool,
        idle_timeout_seconds: Option<i64>,
    ) -> Result<SessionInfo> {
        if pool_ref.is_empty() {
            return Err(Error::InvalidArgument("poolRef is required".to_string()));
        }
        let namespace = namespace.unwrap_or(&self.settings.namespace).to_string();

        // Pre-flight: fail fast instead of burning the whole ready deadline
        // on a pool that cannot produce a pod.
        self.check_pool_health(&namespace, pool_ref).await?;

        let name = format!("gw-{}", self.clock.now().timestamp_millis());
        let sandbox = Sandbox::new(
            &name,
            SandboxSpec {
                pool_ref: pool_ref.to_string(),
                keep_alive,
                idle_timeout_seconds,
                resources: None,
            },
        );
        self.backend.create_sandbox(&namespace, sandbox).await?;

        let status = match self.wait_for_ready(&namespace, &name, pool_ref).await {
            Ok(status) => status,
            Err(e) => {
                // The pending sandbox is useless now; reap it best-effort.
                if let Err(delete_err) = self.backend.delete_sandbox(&namespace, &name).await {
                    if !delete_err.is_not_found() {
                        warn!(sandbox = %name, error = %delete_err, "failed to clean up sandbox");
                    }
                }
                return Err(e);
            }
        };

        let session = Arc::new(Session::new(
            name.clone(),
            namespace,
            pool_ref.to_string(),
            self.clock.now(),
            meta_from_status(&name, &status),
        ));
        self.registry.insert(session.clone());
        info!(session = %name, pod = %session.meta().pod_name, "session created");
        Ok(session.info())
    }

    pub fn get_session(&self, id: &str) -> Result<SessionInfo> {
        self.session(id).map(|s| s.info())
    }

    /// Re-adopt an existing Sandbox after a gateway restart. History is not
    /// recoverable from process memory; the session starts with an empty
    /// log and indices restart at zero.
    pub async fn attach_session(&self, id: &str, namespace: Option<&str>) -> Result<SessionInfo> {
        let namespace = namespace.unwrap_or(&self.settings.namespace).to_string();
        let sandbox = self.backend.get_sandbox(&namespace, id).await?;
        let status = sandbox
            .status
            .clone()
            .filter(|s| s.phase == SandboxPhase::Ready)
            .ok_or_else(|| Error::Upstream(format!("sandbox {id} is not Ready")))?;

        let created_at = sandbox
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(|| self.clock.now());
        let session = Arc::new(Session::new(
            id.to_string(),
            namespace,
            sandbox.spec.pool_ref.clone(),
            created_at,
            meta_from_status(id, &status),
        ));
        self.registry.insert(session.clone());
        Ok(session.info())
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let session = self.session(id)?;
        let meta = session.meta();
        match self
            .backend
            .delete_sandbox(&session.namespace, &meta.sandbox_name)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.registry.remove(id);
        Ok(())
    }

    // ===== Step execution =====

    pub async fn execute_steps(
        &self,
        id: &str,
        steps: Vec<StepRequest>,
        trace_id: Option<String>,
    ) -> Result<ExecuteResponse> {
        let session = self.session(id)?;
        for (position, step) in steps.iter().enumerate() {
            if step.command.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "step {position} ({}) has no command",
                    step.name
                )));
            }
        }

        // One execute at a time per session; indices assigned under the lock
        // form the history's total order.
        let _guard = session.exec_lock.lock().await;
        let call_started = Instant::now();
        let mut results = Vec::with_capacity(steps.len());

        for step in steps {
            let record = self.run_step(&session, &step).await?;
            self.trajectory.write(trajectory_entry(
                &session.id,
                &record,
                trace_id.clone(),
            ));
            results.push(record);
        }

        // lastTaskTime is advisory; a failed patch must not fail the call.
        let backend = self.backend.clone();
        let namespace = session.namespace.clone();
        let sandbox_name = session.meta().sandbox_name;
        let now = self.clock.now();
        tokio::spawn(async move {
            if let Err(e) = backend.touch_sandbox(&namespace, &sandbox_name, now).await {
                warn!(sandbox = %sandbox_name, error = %e, "lastTaskTime patch failed");
            }
        });

        Ok(ExecuteResponse {
            session_id: session.id.clone(),
            results,
            total_duration_ms: call_started.elapsed().as_millis() as u64,
        })
    }

    async fn run_step(&self, session: &Session, step: &StepRequest) -> Result<StepRecord> {
        let index = session.claim_index();
        let snapshot_id = index.to_string();
        let input = serde_json::to_string(step)?;
        let meta = session.meta();

        let step_started = Instant::now();
        let output = match self.sidecar.execute(&meta.pod_ip, exec_spec(step, &meta)).await {
            Ok(output) => output,
            // Per-step failures surface in the result, never as a call error.
            Err(e) => CommandOutput {
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: 1,
            },
        };
        let duration_ms = step_started.elapsed().as_millis() as u64;

        metrics::histogram!(STEP_DURATION).record(step_started.elapsed().as_secs_f64());
        let result = if output.exit_code == 0 { "ok" } else { "error" };
        metrics::counter!(STEP_TOTAL, "result" => result).increment(1);

        let record = StepRecord {
            index,
            name: step.name.clone(),
            input,
            output,
            snapshot_id,
            duration_ms,
            timestamp: self.clock.now(),
        };
        session.push_record(record.clone());
        Ok(record)
    }

    // ===== Restore =====

    /// Rebuild the state after step `snapshot_id` by replaying the history
    /// prefix on a fresh pod, then rotate the session onto it. Any failure
    /// leaves the session bound to its old sandbox.
    pub async fn restore(&self, id: &str, snapshot_id: &str) -> Result<()> {
        let session = self.session(id)?;
        let target: i64 = snapshot_id
            .trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("snapshot id {snapshot_id:?} is not an integer")))?;
        if target < 0 {
            return Err(Error::InvalidArgument(format!(
                "snapshot id {target} is negative"
            )));
        }
        let target = target as u64;

        let _guard = session.exec_lock.lock().await;
        let restore_started = Instant::now();

        let max_index = session.max_index().ok_or_else(|| {
            Error::InvalidArgument("session has no history to restore".to_string())
        })?;
        if target > max_index {
            return Err(Error::InvalidArgument(format!(
                "snapshot {target} is beyond the history (max {max_index})"
            )));
        }
        let prefix: Vec<StepRecord> = session
            .history()
            .into_iter()
            .filter(|r| r.index <= target)
            .collect();

        let new_name = format!("gw-{}", self.clock.now().timestamp_millis());
        let sandbox = Sandbox::new(
            &new_name,
            SandboxSpec {
                pool_ref: session.pool_ref.clone(),
                keep_alive: true,
                idle_timeout_seconds: None,
                resources: None,
            },
        );
        self.backend.create_sandbox(&session.namespace, sandbox).await?;

        let replayed = async {
            let status = self
                .wait_for_ready(&session.namespace, &new_name, &session.pool_ref)
                .await?;
            let meta = meta_from_status(&new_name, &status);
            for record in &prefix {
                let step: StepRequest = serde_json::from_str(&record.input).map_err(|e| {
                    Error::InvalidArgument(format!(
                        "history record {} is not replayable: {e}",
                        record.index
                    ))
                })?;
                // Replay aborts on transport failure only; a nonzero exit
                // code is a faithful re-execution of the original step.
                self.sidecar
                    .execute(&meta.pod_ip, exec_spec(&step, &meta))
                    .await
                    .map_err(|e| {
                        Error::Upstream(format!("replay of step {} failed: {e}", record.index))
                    })?;
            }
            Ok::<SessionMeta, Error>(meta)
        }
        .await;

        let meta = match replayed {
            Ok(meta) => meta,
            Err(e) => {
                metrics::counter!(RESTORE_TOTAL, "result" => "error").increment(1);
                if let Err(delete_err) = self
                    .backend
                    .delete_sandbox(&session.namespace, &new_name)
                    .await
                {
                    warn!(sandbox = %new_name, error = %delete_err, "failed to reap restore sandbox");
                }
                return Err(e);
            }
        };

        let old_name = session.meta().sandbox_name;
        session.rotate(meta);
        session.truncate_after(target);

        let backend = self.backend.clone();
        let namespace = session.namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.delete_sandbox(&namespace, &old_name).await {
                if !e.is_not_found() {
                    warn!(sandbox = %old_name, error = %e, "failed to delete replaced sandbox");
                }
            }
        });

        metrics::histogram!(RESTORE_DURATION).record(restore_started.elapsed().as_secs_f64());
        metrics::counter!(RESTORE_TOTAL, "result" => "ok").increment(1);
        info!(session = %id, snapshot = target, sandbox = %new_name, "session restored");
        Ok(())
    }

    // ===== History =====

    pub fn history(&self, id: &str) -> Result<Vec<StepRecord>> {
        Ok(self.session(id)?.history())
    }

    /// One JSON object per step, newline-delimited, oldest first.
    pub fn export_trajectory(&self, id: &str) -> Result<String> {
        let session = self.session(id)?;
        let mut out = String::new();
        for record in session.history() {
            let entry = trajectory_entry(&session.id, &record, None);
            out.push_str(&serde_json::to_string(&entry)?);
            out.push('\n');
        }
        Ok(out)
    }

    // ===== Pool passthrough =====

    pub async fn create_pool(
        &self,
        name: &str,
        namespace: Option<&str>,
        image: &str,
        replicas: Option<i32>,
        tools: Option<Vec<ToolSource>>,
        resources: Option<ResourceSpec>,
        workspace_dir: Option<String>,
    ) -> Result<PoolInfo> {
        if !is_dns_label(name) {
            return Err(Error::InvalidArgument(format!(
                "pool name {name:?} is not a DNS label"
            )));
        }
        if image.is_empty() {
            return Err(Error::InvalidArgument("image is required".to_string()));
        }
        let namespace = namespace.unwrap_or(&self.settings.namespace).to_string();
        let replicas = replicas.unwrap_or(self.settings.default_pool_replicas);
        let pool = WarmPool::new(
            name,
            WarmPoolSpec {
                replicas,
                template: PoolTemplate {
                    image: image.to_string(),
                    sidecar_image: None,
                    resources,
                    workspace_dir,
                    env: None,
                },
                tools: tools.unwrap_or_default(),
                image_locality: None,
            },
        );
        self.backend.create_pool(&namespace, pool).await?;
        Ok(PoolInfo {
            name: name.to_string(),
            namespace,
            replicas,
            ready_replicas: 0,
            allocated_replicas: 0,
            image: image.to_string(),
        })
    }

    pub async fn pool_info(&self, namespace: Option<&str>, name: &str) -> Result<PoolInfo> {
        let namespace = namespace.unwrap_or(&self.settings.namespace).to_string();
        let pool = self.backend.get_pool(&namespace, name).await?;
        let status = pool.status.clone().unwrap_or_default();
        Ok(PoolInfo {
            name: name.to_string(),
            namespace,
            replicas: pool.spec.replicas,
            ready_replicas: status.ready_replicas,
            allocated_replicas: status.allocated_replicas,
            image: pool.spec.template.image.clone(),
        })
    }

    pub async fn scale_pool(
        &self,
        namespace: Option<&str>,
        name: &str,
        replicas: i32,
        resources: Option<ResourceSpec>,
    ) -> Result<()> {
        if replicas < 0 {
            return Err(Error::InvalidArgument("replicas must be >= 0".to_string()));
        }
        let namespace = namespace.unwrap_or(&self.settings.namespace);
        self.backend
            .scale_pool(namespace, name, replicas, resources)
            .await
    }

    pub async fn delete_pool(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let namespace = namespace.unwrap_or(&self.settings.namespace);
        self.backend.delete_pool(namespace, name).await
    }

    // ===== Internals =====

    pub fn session(&self, id: &str) -> Result<Arc<Session>> {
        self.registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("session {id}")))
    }

    pub fn sidecar(&self) -> Arc<dyn SidecarClient> {
        self.sidecar.clone()
    }

    async fn check_pool_health(&self, namespace: &str, pool_ref: &str) -> Result<WarmPool> {
        let pool = self.backend.get_pool(namespace, pool_ref).await?;
        if let Some(reason) = pool.unhealthy_reason() {
            return Err(Error::PoolUnhealthy(reason));
        }
        Ok(pool)
    }

    /// Poll the Sandbox until Ready, re-checking pool health along the way
    /// so a pool failure surfaces in seconds, not at the deadline.
    async fn wait_for_ready(
        &self,
        namespace: &str,
        name: &str,
        pool_ref: &str,
    ) -> Result<SandboxStatus> {
        let deadline = self.settings.session_ready_timeout;
        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            let sandbox = self.backend.get_sandbox(namespace, name).await?;
            match sandbox.phase() {
                Some(SandboxPhase::Ready) => {
                    if let Some(status) = sandbox.status.clone() {
                        if status.pod_ip.is_some() {
                            return Ok(status);
                        }
                    }
                }
                Some(SandboxPhase::Failed) => {
                    let message = sandbox
                        .status
                        .as_ref()
                        .and_then(|s| s.conditions.last())
                        .and_then(|c| c.message.clone())
                        .unwrap_or_else(|| "sandbox failed".to_string());
                    return Err(Error::Upstream(format!("sandbox {name} failed: {message}")));
                }
                _ => {}
            }

            polls += 1;
            if polls % HEALTH_CHECK_EVERY == 0 {
                self.check_pool_health(namespace, pool_ref).await?;
            }
            if started.elapsed() >= deadline {
                let diagnosis = self
                    .backend
                    .get_pool(namespace, pool_ref)
                    .await
                    .map(|p| p.diagnosis())
                    .unwrap_or_else(|_| "pool unavailable".to_string());
                return Err(Error::Timeout(format!(
                    "sandbox {name} in pool {pool_ref} not Ready after {}s ({diagnosis})",
                    deadline.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

fn meta_from_status(sandbox_name: &str, status: &SandboxStatus) -> SessionMeta {
    SessionMeta {
        sandbox_name: sandbox_name.to_string(),
        pod_ip: status.pod_ip.clone().unwrap_or_default(),
        pod_name: status.pod_name.clone().unwrap_or_default(),
        work_dir: status
            .work_dir
            .clone()
            .unwrap_or_else(|| crate::config::DEFAULT_WORKSPACE_DIR.to_string()),
    }
}

fn exec_spec(step: &StepRequest, meta: &SessionMeta) -> ExecSpec {
    ExecSpec {
        command: step.command.clone(),
        env: step.env.clone().unwrap_or_default(),
        working_dir: Some(
            step.work_dir
                .clone()
                .unwrap_or_else(|| meta.work_dir.clone()),
        ),
        timeout_seconds: None,
    }
}

fn trajectory_entry(session_id: &str, record: &StepRecord, trace_id: Option<String>) -> TrajectoryEntry {
    TrajectoryEntry {
        session_id: session_id.to_string(),
        step: record.index,
        name: record.name.clone(),
        action: record.input.clone(),
        observation: serde_json::to_string(&record.output).unwrap_or_default(),
        snapshot_id: record.snapshot_id.clone(),
        duration_ms: record.duration_ms,
        timestamp: record.timestamp,
        trace_id,
    }
}

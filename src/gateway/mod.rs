//! Request-level control plane fronting sessions.

pub mod api;
pub mod backend;
pub mod runtime;
pub mod session;
pub mod shell;
pub mod sidecar_client;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::clock::SystemClock;
use crate::config::Settings;
use crate::gateway::backend::KubeBackend;
use crate::gateway::runtime::SessionRuntime;
use crate::gateway::sidecar_client::TcpSidecarClient;
use crate::trajectory::{
    JsonlSink, NoopSink, TrajectorySink, TrajectoryWriter, DEFAULT_BATCH_SIZE,
    DEFAULT_FLUSH_INTERVAL,
};

pub async fn run(settings: Settings) -> Result<()> {
    if settings.enable_metrics {
        crate::metrics::install_exporter(settings.metrics_addr)?;
    }

    let client = kube::Client::try_default()
        .await
        .context("failed to build a Kubernetes client")?;
    let clock = Arc::new(SystemClock);

    let sink: Arc<dyn TrajectorySink> = match &settings.trajectory_dir {
        Some(dir) => {
            info!(dir, "trajectory persistence enabled");
            Arc::new(JsonlSink::new(
                dir,
                settings.trajectory_retention_days,
                clock.clone(),
            ))
        }
        None => {
            info!("trajectory persistence disabled");
            Arc::new(NoopSink)
        }
    };
    let trajectory = TrajectoryWriter::spawn(sink, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL);

    let runtime = Arc::new(SessionRuntime::new(
        Arc::new(KubeBackend::new(client.clone())),
        Arc::new(TcpSidecarClient::new(
            settings.sidecar_rpc_port,
            settings.sidecar_call_timeout,
        )),
        clock,
        trajectory,
        settings.clone(),
    ));

    // Re-adopt sandboxes that survived a gateway restart. Their history is
    // gone with the old process; the sessions come back empty.
    rehydrate_sessions(&client, &runtime, &settings.namespace).await;

    let listener = TcpListener::bind(("0.0.0.0", settings.gateway_port))
        .await
        .context("failed to bind gateway port")?;
    info!(port = settings.gateway_port, "gateway listening");
    axum::serve(listener, api::router(runtime))
        .await
        .context("gateway server exited")
}

async fn rehydrate_sessions(client: &kube::Client, runtime: &SessionRuntime, namespace: &str) {
    use crate::crd::{Sandbox, SandboxPhase};
    use kube::api::{Api, ListParams};

    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    let listed = match sandboxes.list(&ListParams::default()).await {
        Ok(listed) => listed,
        Err(e) => {
            warn!(error = %e, "could not list sandboxes for session rehydration");
            return;
        }
    };
    for sandbox in listed.items {
        if sandbox.phase() != Some(SandboxPhase::Ready) {
            continue;
        }
        let name = sandbox.metadata.name.clone().unwrap_or_default();
        match runtime.attach_session(&name, Some(namespace)).await {
            Ok(info) => info!(session = %info.id, "re-attached surviving sandbox"),
            Err(e) => warn!(sandbox = %name, error = %e, "failed to re-attach sandbox"),
        }
    }
}

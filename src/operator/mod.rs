//! The controllers: warm-pool and sandbox reconciliation.

pub mod podspec;
pub mod pool;
pub mod sandbox;

use anyhow::{Context as _, Result};
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Settings;

/// Shared state injected into every reconcile call.
pub struct Context {
    pub client: Client,
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
}

pub async fn run(settings: Settings) -> Result<()> {
    if settings.enable_metrics {
        crate::metrics::install_exporter(settings.metrics_addr)?;
    }
    if settings.enable_webhooks {
        warn!("ENABLE_WEBHOOKS is set; the admission service is deployed separately");
    }

    let client = Client::try_default()
        .await
        .context("failed to build a Kubernetes client")?;
    let ctx = Arc::new(Context {
        client: client.clone(),
        settings,
        clock: Arc::new(SystemClock),
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal.cancel();
    });

    info!("starting warmpool and sandbox controllers");
    tokio::join!(
        pool::run(client.clone(), ctx.clone(), shutdown.clone()),
        sandbox::run(client, ctx, shutdown),
    );
    Ok(())
}

/// CRD manifests for installation, WarmPool first.
pub fn crd_manifests() -> Result<String> {
    use kube::CustomResourceExt;

    let warmpool = serde_yaml::to_string(&crate::crd::WarmPool::crd())
        .context("failed to serialize WarmPool CRD")?;
    let sandbox = serde_yaml::to_string(&crate::crd::Sandbox::crd())
        .context("failed to serialize Sandbox CRD")?;
    Ok(format!("{warmpool}---\n{sandbox}"))
}

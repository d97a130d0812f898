//! Metric names and the Prometheus exporter.
//!
//! All series are registered up front with help text; recording sites use
//! the constants so a rename stays a one-line change.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub const POOL_READY_REPLICAS: &str = "arl_pool_ready_replicas";
pub const POOL_ALLOCATED_REPLICAS: &str = "arl_pool_allocated_replicas";
pub const SANDBOX_READY_DURATION: &str = "arl_sandbox_ready_duration_seconds";
pub const SANDBOX_IDLE_SECONDS: &str = "arl_sandbox_idle_seconds";
pub const NO_IDLE_PODS: &str = "arl_no_idle_pods_total";
pub const STEP_DURATION: &str = "arl_gateway_step_duration_seconds";
pub const STEP_TOTAL: &str = "arl_gateway_step_total";
pub const SIDECAR_CALL_DURATION: &str = "arl_sidecar_call_duration_seconds";
pub const RESTORE_DURATION: &str = "arl_restore_duration_seconds";
pub const RESTORE_TOTAL: &str = "arl_restore_total";
pub const RECONCILE_TOTAL: &str = "arl_reconcile_total";
pub const IMAGE_PULL_ERRORS: &str = "arl_image_pull_errors_total";
pub const POD_READY_DURATION: &str = "arl_pod_ready_duration_seconds";
pub const TRAJECTORY_WRITE_ERRORS: &str = "arl_trajectory_write_errors_total";

pub fn describe() {
    describe_gauge!(POOL_READY_REPLICAS, "Idle ready pods per pool");
    describe_gauge!(POOL_ALLOCATED_REPLICAS, "Allocated pods per pool");
    describe_histogram!(
        SANDBOX_READY_DURATION,
        "Sandbox creation to Ready, end to end"
    );
    describe_histogram!(SANDBOX_IDLE_SECONDS, "Idle time of reclaimed sandboxes");
    describe_counter!(NO_IDLE_PODS, "Bind passes that found no idle pod");
    describe_histogram!(STEP_DURATION, "Gateway step execution duration");
    describe_counter!(STEP_TOTAL, "Gateway steps by result");
    describe_histogram!(SIDECAR_CALL_DURATION, "Sidecar RPC duration by method");
    describe_histogram!(RESTORE_DURATION, "Session restore duration");
    describe_counter!(RESTORE_TOTAL, "Session restores by result");
    describe_counter!(RECONCILE_TOTAL, "Reconciliations by controller and outcome");
    describe_counter!(IMAGE_PULL_ERRORS, "Pods observed in image-pull backoff");
    describe_histogram!(POD_READY_DURATION, "Pod creation to Ready by node");
    describe_counter!(
        TRAJECTORY_WRITE_ERRORS,
        "Trajectory batches that failed to persist"
    );
}

/// Install the Prometheus recorder and its scrape endpoint. Call once per
/// process, before the first recording site runs.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    Ok(())
}

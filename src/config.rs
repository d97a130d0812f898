//! Environment-driven configuration.
//!
//! Every knob has a default so each binary starts with no configuration at
//! all. `Settings::from_env` reads the process environment; the lookup
//! indirection exists so tests can feed a plain map instead of mutating
//! process state.

use std::net::SocketAddr;
use std::time::Duration;

/// Default pod-side workspace mount.
pub const DEFAULT_WORKSPACE_DIR: &str = "/workspace";

/// Default executor-agent socket shared between the two containers.
pub const DEFAULT_AGENT_SOCKET: &str = "/var/run/arl/agent.sock";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Gateway HTTP port (`GATEWAY_PORT`)
    pub gateway_port: u16,
    /// Sidecar RPC port (`SIDECAR_GRPC_PORT`; the name is historical)
    pub sidecar_rpc_port: u16,
    /// Sidecar health/readiness port (`SIDECAR_HEALTH_PORT`)
    pub sidecar_health_port: u16,
    /// Executor-agent socket path; empty disables proxying (`AGENT_SOCKET`)
    pub agent_socket: Option<String>,
    /// How long the sidecar waits for the agent before giving up
    pub agent_ready_timeout: Duration,
    /// Workspace mount path inside pods (`WORKSPACE_DIR`)
    pub workspace_dir: String,
    /// Replicas for pools created without an explicit count
    pub default_pool_replicas: i32,
    /// Idle TTL applied when a sandbox does not set one
    pub sandbox_idle_timeout: Duration,
    /// Sandbox controller resync interval driving idle reclamation
    pub sandbox_resync: Duration,
    /// Pending sandboxes fail after this many fruitless bind passes
    pub sandbox_bind_max_attempts: i64,
    /// CreateSession / Restore wait-for-Ready deadline
    pub session_ready_timeout: Duration,
    /// Default deadline for non-streaming sidecar calls
    pub sidecar_call_timeout: Duration,
    /// Trajectory JSONL directory; unset selects the no-op sink
    pub trajectory_dir: Option<String>,
    /// Days of trajectory partitions to keep
    pub trajectory_retention_days: i64,
    pub enable_metrics: bool,
    pub metrics_addr: SocketAddr,
    /// Admission webhooks are served by an external collaborator; this flag
    /// is only surfaced in logs so operators notice a missing deployment.
    pub enable_webhooks: bool,
    /// Image used for the sidecar container in pool pods (`ARL_IMAGE`)
    pub arl_image: String,
    /// Namespace used when requests omit one (`POD_NAMESPACE`)
    pub namespace: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_port: 8080,
            sidecar_rpc_port: 9090,
            sidecar_health_port: 8080,
            agent_socket: Some(DEFAULT_AGENT_SOCKET.to_string()),
            agent_ready_timeout: Duration::from_secs(60),
            workspace_dir: DEFAULT_WORKSPACE_DIR.to_string(),
            default_pool_replicas: 3,
            sandbox_idle_timeout: Duration::from_secs(600),
            sandbox_resync: Duration::from_secs(2),
            sandbox_bind_max_attempts: 150,
            session_ready_timeout: Duration::from_secs(120),
            sidecar_call_timeout: Duration::from_secs(30),
            trajectory_dir: None,
            trajectory_retention_days: 90,
            enable_metrics: false,
            metrics_addr: "0.0.0.0:9464".parse().expect("static addr"),
            enable_webhooks: false,
            arl_image: "ghcr.io/arl-dev/arl:latest".to_string(),
            namespace: "default".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.parse().ok())
        }
        let parse_secs = |key: &str| {
            lookup(key)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
        };
        let truthy = |key: &str| {
            lookup(key)
                .map(|v| {
                    let v = v.to_lowercase();
                    v == "1" || v == "true" || v == "yes"
                })
                .unwrap_or(false)
        };

        Self {
            gateway_port: parsed(&lookup, "GATEWAY_PORT").unwrap_or(defaults.gateway_port),
            sidecar_rpc_port: parsed(&lookup, "SIDECAR_GRPC_PORT").unwrap_or(defaults.sidecar_rpc_port),
            sidecar_health_port: parsed(&lookup, "SIDECAR_HEALTH_PORT")
                .unwrap_or(defaults.sidecar_health_port),
            agent_socket: match lookup("AGENT_SOCKET") {
                Some(path) if path.is_empty() => None,
                Some(path) => Some(path),
                None => defaults.agent_socket,
            },
            agent_ready_timeout: parse_secs("AGENT_READY_TIMEOUT_SECONDS")
                .unwrap_or(defaults.agent_ready_timeout),
            workspace_dir: lookup("WORKSPACE_DIR").unwrap_or(defaults.workspace_dir),
            default_pool_replicas: parsed(&lookup, "DEFAULT_POOL_REPLICAS")
                .unwrap_or(defaults.default_pool_replicas),
            sandbox_idle_timeout: parse_secs("SANDBOX_IDLE_TIMEOUT_SECONDS")
                .unwrap_or(defaults.sandbox_idle_timeout),
            sandbox_resync: parse_secs("SANDBOX_RESYNC_SECONDS").unwrap_or(defaults.sandbox_resync),
            sandbox_bind_max_attempts: parsed(&lookup, "SANDBOX_BIND_MAX_ATTEMPTS")
                .unwrap_or(defaults.sandbox_bind_max_attempts),
            session_ready_timeout: parse_secs("SESSION_READY_TIMEOUT_SECONDS")
                .unwrap_or(defaults.session_ready_timeout),
            sidecar_call_timeout: parse_secs("SIDECAR_CALL_TIMEOUT_SECONDS")
                .unwrap_or(defaults.sidecar_call_timeout),
            trajectory_dir: lookup("TRAJECTORY_DIR").filter(|v| !v.is_empty()),
            trajectory_retention_days: parsed(&lookup, "TRAJECTORY_RETENTION_DAYS")
                .unwrap_or(defaults.trajectory_retention_days),
            enable_metrics: truthy("ENABLE_METRICS"),
            metrics_addr: parsed(&lookup, "METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            enable_webhooks: truthy("ENABLE_WEBHOOKS"),
            arl_image: lookup("ARL_IMAGE").unwrap_or(defaults.arl_image),
            namespace: lookup("POD_NAMESPACE").unwrap_or(defaults.namespace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_with_empty_environment() {
        let settings = settings_from(&[]);
        assert_eq!(settings.gateway_port, 8080);
        assert_eq!(settings.sidecar_rpc_port, 9090);
        assert_eq!(settings.default_pool_replicas, 3);
        assert_eq!(settings.sandbox_idle_timeout, Duration::from_secs(600));
        assert_eq!(settings.workspace_dir, "/workspace");
        assert!(!settings.enable_metrics);
        assert!(settings.trajectory_dir.is_none());
        assert_eq!(settings.agent_socket.as_deref(), Some(DEFAULT_AGENT_SOCKET));
    }

    #[test]
    fn environment_overrides_defaults() {
        let settings = settings_from(&[
            ("GATEWAY_PORT", "9999"),
            ("SIDECAR_GRPC_PORT", "7070"),
            ("SANDBOX_IDLE_TIMEOUT_SECONDS", "42"),
            ("ENABLE_METRICS", "true"),
            ("TRAJECTORY_DIR", "/var/lib/arl/trajectory"),
            ("POD_NAMESPACE", "sandboxes"),
        ]);
        assert_eq!(settings.gateway_port, 9999);
        assert_eq!(settings.sidecar_rpc_port, 7070);
        assert_eq!(settings.sandbox_idle_timeout, Duration::from_secs(42));
        assert!(settings.enable_metrics);
        assert_eq!(
            settings.trajectory_dir.as_deref(),
            Some("/var/lib/arl/trajectory")
        );
        assert_eq!(settings.namespace, "sandboxes");
    }

    #[test]
    fn empty_agent_socket_disables_proxying() {
        let settings = settings_from(&[("AGENT_SOCKET", "")]);
        assert!(settings.agent_socket.is_none());
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let settings = settings_from(&[("GATEWAY_PORT", "not-a-port")]);
        assert_eq!(settings.gateway_port, 8080);
    }
}

//! Custom resources: `WarmPool` and `Sandbox`.
//!
//! Both are declarative resources under `arl.dev/v1alpha1` with status
//! subresources, defined with kube-derive. The sandbox lifecycle graph and
//! its validator live here too so controllers and tests share one source of
//! truth.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Pod label naming the owning pool.
pub const POOL_LABEL: &str = "pool";
/// Pod label carrying the allocation state.
pub const POD_STATE_LABEL: &str = "pod-state";
/// Pod label naming the bound sandbox while allocated.
pub const SANDBOX_LABEL: &str = "sandbox";
pub const POD_STATE_READY: &str = "ready";
pub const POD_STATE_ALLOCATED: &str = "allocated";

/// Finalizer implementing return-or-destroy of the bound pod.
pub const SANDBOX_FINALIZER: &str = "arl.dev/release-pod";

/// Tools land here inside every pool pod.
pub const TOOLS_DIR: &str = "/opt/arl/tools";

// ===== WarmPool =====

/// A named template for a population of pre-warmed idle pods.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "arl.dev",
    version = "v1alpha1",
    kind = "WarmPool",
    plural = "warmpools",
    shortname = "wp",
    status = "WarmPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolSpec {
    /// Desired number of idle, ready pods
    #[serde(default)]
    pub replicas: i32,
    pub template: PoolTemplate,
    /// Tool trees copied into /opt/arl/tools by init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_locality: Option<ImageLocality>,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolTemplate {
    /// Executor (user) container image
    pub image: String,
    /// Sidecar image; defaults to the operator's own image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    /// Workspace mount path; defaults to /workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

/// Quantity strings applied as both requests and limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// One tool tree: an image carrying `/tools`, a ConfigMap, or inline files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolSource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageLocality {
    #[serde(default)]
    pub enabled: bool,
    /// Fraction of `replicas` worth of nodes to concentrate on
    #[serde(default = "default_spread_factor")]
    pub spread_factor: f64,
    /// Preferred node-affinity weight
    #[serde(default = "default_locality_weight")]
    pub weight: i32,
}

fn default_spread_factor() -> f64 {
    0.25
}

fn default_locality_weight() -> i32 {
    100
}

impl ImageLocality {
    /// Number of nodes to concentrate on: `ceil(replicas * spreadFactor)`,
    /// with the factor clamped to its documented range.
    pub fn node_budget(&self, replicas: i32) -> usize {
        let factor = self.spread_factor.clamp(0.0, 10.0);
        (replicas.max(0) as f64 * factor).ceil() as usize
    }

    pub fn clamped_weight(&self) -> i32 {
        self.weight.clamp(1, 100)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolStatus {
    /// Idle pods that are Ready
    #[serde(default)]
    pub ready_replicas: i32,
    /// Pods currently bound to a sandbox
    #[serde(default)]
    pub allocated_replicas: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PODS_FAILING: &str = "PodsFailing";

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False"
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(
        type_: &str,
        truthy: bool,
        reason: Option<&str>,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status: if truthy { "True" } else { "False" }.to_string(),
            reason: reason.map(str::to_string),
            message: message.map(str::to_string),
            last_transition_time: Some(now.to_rfc3339()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

impl WarmPool {
    /// A pool is unhealthy for new sandboxes when pods are failing and
    /// nothing idle is left to bind. Returns a diagnostic message.
    pub fn unhealthy_reason(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        let failing = find_condition(&status.conditions, CONDITION_PODS_FAILING)
            .filter(|c| c.is_true())?;
        if status.ready_replicas > 0 {
            return None;
        }
        Some(format!(
            "pool {} has PodsFailing=True with 0 ready replicas ({} allocated): {}",
            self.metadata.name.as_deref().unwrap_or("?"),
            status.allocated_replicas,
            failing.message.as_deref().unwrap_or("no message")
        ))
    }

    /// Short human diagnosis used in timeout errors.
    pub fn diagnosis(&self) -> String {
        let (ready, allocated) = self
            .status
            .as_ref()
            .map(|s| (s.ready_replicas, s.allocated_replicas))
            .unwrap_or((0, 0));
        let condition = self
            .status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.is_true()))
            .map(|c| format!("{}={}", c.type_, c.message.as_deref().unwrap_or("True")))
            .unwrap_or_else(|| "no conditions".to_string());
        format!("ready={ready} allocated={allocated} {condition}")
    }
}

// ===== Sandbox =====

/// A reservation of one pool pod for one session.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "arl.dev",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    shortname = "sbx",
    status = "SandboxStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    /// Name of the WarmPool to bind from
    pub pool_ref: String,
    /// Return the pod to the pool on delete instead of destroying it
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// RFC 3339 wall clock of the last gateway execute touch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_time: Option<String>,
    /// Fruitless bind passes while Pending
    #[serde(default)]
    pub bind_attempts: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema,
)]
pub enum SandboxPhase {
    #[default]
    Pending,
    Bound,
    Ready,
    Failed,
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Bound => "Bound",
            SandboxPhase::Ready => "Ready",
            SandboxPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Validate a phase transition against the lifecycle graph. `None` is the
/// state before the controller first writes status. Same-state writes are
/// idempotent self-loops and always allowed.
pub fn validate_transition(from: Option<SandboxPhase>, to: SandboxPhase) -> Result<()> {
    use SandboxPhase::*;
    let legal = match (from, to) {
        (None, Pending) => true,
        (Some(a), b) if a == b => true,
        (Some(Pending), Bound) => true,
        (Some(Pending), Failed) => true,
        (Some(Bound), Ready) => true,
        (Some(Bound), Failed) => true,
        (Some(Ready), Failed) => true,
        _ => false,
    };
    if legal {
        Ok(())
    } else {
        Err(Error::IllegalTransition {
            from: from.map(|p| p.to_string()).unwrap_or_else(|| "<none>".into()),
            to: to.to_string(),
        })
    }
}

impl Sandbox {
    pub fn phase(&self) -> Option<SandboxPhase> {
        self.status.as_ref().map(|s| s.phase)
    }

    /// Idle TTL for reclamation. Explicit spec value wins; keep-alive
    /// sandboxes default to 1800s, everything else to the operator default.
    pub fn effective_idle_timeout(&self, default_seconds: i64) -> i64 {
        match self.spec.idle_timeout_seconds {
            Some(secs) if secs >= 0 => secs,
            _ if self.spec.keep_alive => 1800,
            _ => default_seconds,
        }
    }

    /// Parsed `lastTaskTime`, when present and well-formed.
    pub fn last_task_time(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.last_task_time.as_deref())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// RFC 1123 DNS label: lowercase alphanumerics and dashes, at most 63
/// characters, starting and ending alphanumeric.
pub fn is_dns_label(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_matches_the_lifecycle() {
        use SandboxPhase::*;
        // «empty» only enters Pending.
        assert!(validate_transition(None, Pending).is_ok());
        assert!(validate_transition(None, Bound).is_err());
        assert!(validate_transition(None, Ready).is_err());
        assert!(validate_transition(None, Failed).is_err());

        let legal = [
            (Pending, Bound),
            (Pending, Failed),
            (Bound, Ready),
            (Bound, Failed),
            (Ready, Failed),
        ];
        for phase in [Pending, Bound, Ready, Failed] {
            for target in [Pending, Bound, Ready, Failed] {
                let expect = phase == target || legal.contains(&(phase, target));
                assert_eq!(
                    validate_transition(Some(phase), target).is_ok(),
                    expect,
                    "{phase} -> {target}"
                );
            }
        }
    }

    #[test]
    fn failed_is_terminal() {
        for target in [
            SandboxPhase::Pending,
            SandboxPhase::Bound,
            SandboxPhase::Ready,
        ] {
            assert!(validate_transition(Some(SandboxPhase::Failed), target).is_err());
        }
        // Idempotent self-loop still allowed.
        assert!(validate_transition(Some(SandboxPhase::Failed), SandboxPhase::Failed).is_ok());
    }

    #[test]
    fn spec_fields_serialize_camel_case() {
        let spec = SandboxSpec {
            pool_ref: "p1".into(),
            keep_alive: true,
            idle_timeout_seconds: Some(30),
            resources: None,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["poolRef"], "p1");
        assert_eq!(json["keepAlive"], true);
        assert_eq!(json["idleTimeoutSeconds"], 30);
    }

    #[test]
    fn idle_timeout_defaults_depend_on_keep_alive() {
        let mut sandbox = Sandbox::new(
            "s1",
            SandboxSpec {
                pool_ref: "p1".into(),
                keep_alive: true,
                idle_timeout_seconds: None,
                resources: None,
            },
        );
        assert_eq!(sandbox.effective_idle_timeout(600), 1800);
        sandbox.spec.keep_alive = false;
        assert_eq!(sandbox.effective_idle_timeout(600), 600);
        sandbox.spec.idle_timeout_seconds = Some(5);
        assert_eq!(sandbox.effective_idle_timeout(600), 5);
    }

    #[test]
    fn unhealthy_requires_failing_and_no_ready_pods() {
        let mut pool = WarmPool::new(
            "p1",
            WarmPoolSpec {
                replicas: 2,
                template: PoolTemplate {
                    image: "img".into(),
                    sidecar_image: None,
                    resources: None,
                    workspace_dir: None,
                    env: None,
                },
                tools: Vec::new(),
                image_locality: None,
            },
        );
        assert!(pool.unhealthy_reason().is_none());

        let now = Utc::now();
        pool.status = Some(WarmPoolStatus {
            ready_replicas: 1,
            allocated_replicas: 0,
            conditions: vec![Condition::new(
                CONDITION_PODS_FAILING,
                true,
                Some("ImagePullBackOff"),
                Some("pod p1-x is failing"),
                now,
            )],
        });
        assert!(pool.unhealthy_reason().is_none(), "ready pod masks failure");

        pool.status.as_mut().unwrap().ready_replicas = 0;
        let reason = pool.unhealthy_reason().expect("unhealthy");
        assert!(reason.contains("p1"));
        assert!(reason.contains("PodsFailing"));
    }

    #[test]
    fn locality_node_budget_rounds_up() {
        let locality = ImageLocality {
            enabled: true,
            spread_factor: 0.25,
            weight: 100,
        };
        assert_eq!(locality.node_budget(1), 1);
        assert_eq!(locality.node_budget(4), 1);
        assert_eq!(locality.node_budget(5), 2);
        assert_eq!(locality.node_budget(0), 0);
    }

    #[test]
    fn dns_labels() {
        assert!(is_dns_label("p1"));
        assert!(is_dns_label("my-pool-2"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label("-leading"));
        assert!(!is_dns_label("trailing-"));
        assert!(!is_dns_label("UpperCase"));
        assert!(!is_dns_label(&"x".repeat(64)));
    }
}

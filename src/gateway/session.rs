//! Gateway-resident session state.
//!
//! Sessions live in process memory only; a gateway restart loses them and
//! callers re-attach to the surviving Sandbox resources. History is an
//! append-only log ordered by a per-session index that is monotonic for the
//! session's lifetime: truncated by restore, never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

use crate::rpc::CommandOutput;

/// One unit of work submitted to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, rename = "workDir", skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

/// The recorded execution of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u64,
    pub name: String,
    /// Serialized step request, exactly as executed; restore replays this
    pub input: String,
    pub output: CommandOutput,
    pub snapshot_id: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// The pod binding of a session; rotated by restore.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub sandbox_name: String,
    pub pod_ip: String,
    pub pod_name: String,
    pub work_dir: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub sandbox_name: String,
    pub namespace: String,
    pub pool_ref: String,
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    pub pod_name: String,
    pub created_at: DateTime<Utc>,
}

pub struct Session {
    pub id: String,
    pub namespace: String,
    pub pool_ref: String,
    pub created_at: DateTime<Utc>,
    meta: RwLock<SessionMeta>,
    history: Mutex<Vec<StepRecord>>,
    next_index: AtomicU64,
    /// Serializes ExecuteSteps and Restore against each other; indices are
    /// assigned under this lock so the history is a total order.
    pub exec_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(
        id: String,
        namespace: String,
        pool_ref: String,
        created_at: DateTime<Utc>,
        meta: SessionMeta,
    ) -> Self {
        Self {
            id,
            namespace,
            pool_ref,
            created_at,
            meta: RwLock::new(meta),
            history: Mutex::new(Vec::new()),
            next_index: AtomicU64::new(0),
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn info(&self) -> SessionInfo {
        let meta = self.meta();
        SessionInfo {
            id: self.id.clone(),
            sandbox_name: meta.sandbox_name,
            namespace: self.namespace.clone(),
            pool_ref: self.pool_ref.clone(),
            pod_ip: meta.pod_ip,
            pod_name: meta.pod_name,
            created_at: self.created_at,
        }
    }

    pub fn meta(&self) -> SessionMeta {
        self.meta.read().unwrap().clone()
    }

    /// Reserve the next step index. Callers hold `exec_lock`, making the
    /// assignment part of the session's total order.
    pub fn claim_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

    pub fn push_record(&self, record: StepRecord) {
        self.history.lock().unwrap().push(record);
    }

    pub fn history(&self) -> Vec<StepRecord> {
        self.history.lock().unwrap().clone()
    }

    pub fn max_index(&self) -> Option<u64> {
        self.history.lock().unwrap().last().map(|r| r.index)
    }

    /// Drop every record after `target`. The index counter is untouched, so
    /// later steps keep extending the original numbering.
    pub fn truncate_after(&self, target: u64) {
        self.history.lock().unwrap().retain(|r| r.index <= target);
    }

    /// Point the session at a new pod after a successful restore.
    pub fn rotate(&self, meta: SessionMeta) {
        *self.meta.write().unwrap() = meta;
    }
}

/// Concurrent map of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.inner
            .write()
            .unwrap()
            .insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.read().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.write().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

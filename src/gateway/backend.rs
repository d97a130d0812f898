//! Cluster capability set for the gateway.
//!
//! The session runtime depends on this trait rather than on a kube client
//! directly, so the whole request path can run against an in-memory cluster
//! in tests. `KubeBackend` is the production implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;

use crate::crd::{ResourceSpec, Sandbox, SandboxPhase, WarmPool};
use crate::error::{Error, Result};

#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<WarmPool>;
    async fn create_pool(&self, namespace: &str, pool: WarmPool) -> Result<()>;
    async fn scale_pool(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        resources: Option<ResourceSpec>,
    ) -> Result<()>;
    async fn delete_pool(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_sandbox(&self, namespace: &str, sandbox: Sandbox) -> Result<()>;
    async fn get_sandbox(&self, namespace: &str, name: &str) -> Result<Sandbox>;
    async fn delete_sandbox(&self, namespace: &str, name: &str) -> Result<()>;
    /// Best-effort `lastTaskTime` bump; failures are the caller's to log.
    async fn touch_sandbox(&self, namespace: &str, name: &str, when: DateTime<Utc>) -> Result<()>;
}

pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pools(&self, namespace: &str) -> Api<WarmPool> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn sandboxes(&self, namespace: &str) -> Api<Sandbox> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<WarmPool> {
        self.pools(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, format!("pool {namespace}/{name}")))
    }

    async fn create_pool(&self, namespace: &str, pool: WarmPool) -> Result<()> {
        self.pools(namespace)
            .create(&PostParams::default(), &pool)
            .await
            .map_err(|e| Error::from_kube(e, format!("pool {namespace}")))?;
        Ok(())
    }

    async fn scale_pool(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        resources: Option<ResourceSpec>,
    ) -> Result<()> {
        let mut spec = serde_json::json!({ "replicas": replicas });
        if let Some(resources) = resources {
            spec["template"] = serde_json::json!({ "resources": resources });
        }
        self.pools(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "spec": spec })),
            )
            .await
            .map_err(|e| Error::from_kube(e, format!("pool {namespace}/{name}")))?;
        Ok(())
    }

    async fn delete_pool(&self, namespace: &str, name: &str) -> Result<()> {
        // A pool with live bindings cannot be deleted out from under them.
        let bound = self
            .sandboxes(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(e, format!("sandboxes in {namespace}")))?
            .items
            .into_iter()
            .filter(|s| s.spec.pool_ref == name && s.phase() != Some(SandboxPhase::Failed))
            .count();
        if bound > 0 {
            return Err(Error::Conflict(format!(
                "pool {namespace}/{name} still has {bound} bound sandboxes"
            )));
        }

        self.pools(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(e, format!("pool {namespace}/{name}")))?;
        Ok(())
    }

    async fn create_sandbox(&self, namespace: &str, sandbox: Sandbox) -> Result<()> {
        self.sandboxes(namespace)
            .create(&PostParams::default(), &sandbox)
            .await
            .map_err(|e| Error::from_kube(e, format!("sandbox {namespace}")))?;
        Ok(())
    }

    async fn get_sandbox(&self, namespace: &str, name: &str) -> Result<Sandbox> {
        self.sandboxes(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, format!("sandbox {namespace}/{name}")))
    }

    async fn delete_sandbox(&self, namespace: &str, name: &str) -> Result<()> {
        self.sandboxes(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(e, format!("sandbox {namespace}/{name}")))?;
        Ok(())
    }

    async fn touch_sandbox(&self, namespace: &str, name: &str, when: DateTime<Utc>) -> Result<()> {
        self.sandboxes(namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({
                    "status": { "lastTaskTime": when.to_rfc3339() }
                })),
            )
            .await
            .map_err(|e| Error::from_kube(e, format!("sandbox {namespace}/{name}")))?;
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory cluster for runtime and handler tests.

    use super::*;
    use crate::crd::SandboxStatus;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockBackend {
        pub pools: Mutex<HashMap<(String, String), WarmPool>>,
        pub sandboxes: Mutex<HashMap<(String, String), Sandbox>>,
        pub deleted_sandboxes: Mutex<Vec<String>>,
        pub touches: Mutex<Vec<(String, DateTime<Utc>)>>,
        /// Polls a sandbox spends Pending before the mock marks it Ready
        pub ready_after_polls: AtomicU32,
        next_ip: AtomicU32,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_pool(self, namespace: &str, pool: WarmPool) -> Self {
            let name = pool.metadata.name.clone().unwrap_or_default();
            self.pools
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name), pool);
            self
        }
    }

    #[async_trait]
    impl ClusterBackend for MockBackend {
        async fn get_pool(&self, namespace: &str, name: &str) -> Result<WarmPool> {
            self.pools
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("pool {namespace}/{name}")))
        }

        async fn create_pool(&self, namespace: &str, pool: WarmPool) -> Result<()> {
            let name = pool.metadata.name.clone().unwrap_or_default();
            self.pools
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name), pool);
            Ok(())
        }

        async fn scale_pool(
            &self,
            namespace: &str,
            name: &str,
            replicas: i32,
            _resources: Option<ResourceSpec>,
        ) -> Result<()> {
            let mut pools = self.pools.lock().unwrap();
            let pool = pools
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| Error::NotFound(format!("pool {namespace}/{name}")))?;
            pool.spec.replicas = replicas;
            Ok(())
        }

        async fn delete_pool(&self, namespace: &str, name: &str) -> Result<()> {
            self.pools
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| Error::NotFound(format!("pool {namespace}/{name}")))?;
            Ok(())
        }

        async fn create_sandbox(&self, namespace: &str, mut sandbox: Sandbox) -> Result<()> {
            let name = sandbox.metadata.name.clone().unwrap_or_default();
            let ip = 2 + self.next_ip.fetch_add(1, Ordering::SeqCst);
            sandbox.status = Some(SandboxStatus {
                phase: SandboxPhase::Pending,
                pod_name: Some(format!("pod-{ip}")),
                pod_ip: Some(format!("10.244.0.{ip}")),
                work_dir: Some("/workspace".to_string()),
                ..Default::default()
            });
            self.sandboxes
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name), sandbox);
            Ok(())
        }

        async fn get_sandbox(&self, namespace: &str, name: &str) -> Result<Sandbox> {
            let mut sandboxes = self.sandboxes.lock().unwrap();
            let sandbox = sandboxes
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| Error::NotFound(format!("sandbox {namespace}/{name}")))?;
            if sandbox.phase() == Some(SandboxPhase::Pending) {
                let remaining = self.ready_after_polls.load(Ordering::SeqCst);
                if remaining == 0 {
                    sandbox.status.as_mut().expect("status set").phase = SandboxPhase::Ready;
                } else {
                    self.ready_after_polls.store(remaining - 1, Ordering::SeqCst);
                }
            }
            Ok(sandbox.clone())
        }

        async fn delete_sandbox(&self, namespace: &str, name: &str) -> Result<()> {
            self.deleted_sandboxes.lock().unwrap().push(name.to_string());
            self.sandboxes
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| Error::NotFound(format!("sandbox {namespace}/{name}")))?;
            Ok(())
        }

        async fn touch_sandbox(
            &self,
            _namespace: &str,
            name: &str,
            when: DateTime<Utc>,
        ) -> Result<()> {
            self.touches.lock().unwrap().push((name.to_string(), when));
            Ok(())
        }
    }
}

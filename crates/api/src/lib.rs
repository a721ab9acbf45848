//! Mesh dev-space API surface for frontends.
//!
//! Frontends hold one [`SharedManagerRegistry`] for the life of the process and
//! ask it for the [`MeshManager`] of a cluster credential. The registry owns
//! every manager it builds; dropping a credential closes that manager's cache.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use meshdev_core::{MeshError, MeshResult};
use meshdev_kubehub::{ClusterClient, KubeClusterClient};
use metrics::gauge;
use rustc_hash::FxHasher;
use tokio::sync::Mutex;
use tracing::info;

pub use meshdev_mesh::{MeshManager, RollbackReport, Settings};

/// Turns a cluster credential into a client for that cluster.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, credential: &str) -> MeshResult<Arc<dyn ClusterClient>>;
}

/// Credentials are kubeconfig documents (YAML); the current context is used.
pub struct KubeClientFactory {
    field_manager: String,
}

impl KubeClientFactory {
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self { field_manager: field_manager.into() }
    }
}

#[async_trait::async_trait]
impl ClientFactory for KubeClientFactory {
    async fn connect(&self, credential: &str) -> MeshResult<Arc<dyn ClusterClient>> {
        let kubeconfig = Kubeconfig::from_yaml(credential).map_err(|e| MeshError::Validation(format!("kubeconfig: {}", e)))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| MeshError::Kube(format!("kubeconfig: {}", e)))?;
        let client = kube::Client::try_from(config).map_err(|e| MeshError::Kube(e.to_string()))?;
        Ok(Arc::new(KubeClusterClient::new(client, self.field_manager.clone())))
    }
}

/// Short stable tag for a credential, safe to log.
pub fn fingerprint(credential: &str) -> String {
    let mut h = FxHasher::default();
    credential.hash(&mut h);
    format!("{:016x}", h.finish())
}

/// One [`MeshManager`] per cluster credential, built on first use.
pub struct SharedManagerRegistry {
    factory: Arc<dyn ClientFactory>,
    settings: Settings,
    managers: Mutex<HashMap<String, Arc<MeshManager>>>,
}

impl SharedManagerRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>, settings: Settings) -> Self {
        Self { factory, settings, managers: Mutex::new(HashMap::new()) }
    }

    /// Registry over kubeconfig credentials with settings from the environment.
    pub fn from_env() -> Self {
        let settings = Settings::from_env();
        let factory = Arc::new(KubeClientFactory::new(settings.field_manager.clone()));
        Self::new(factory, settings)
    }

    /// The manager for `credential`, connecting on first request. The lock is
    /// held while connecting so a credential never gets two managers.
    pub async fn manager(&self, credential: &str) -> MeshResult<Arc<MeshManager>> {
        let mut managers = self.managers.lock().await;
        if let Some(m) = managers.get(credential) {
            return Ok(Arc::clone(m));
        }
        let client = self.factory.connect(credential).await?;
        let m = Arc::new(MeshManager::new(client, self.settings.clone()));
        managers.insert(credential.to_string(), Arc::clone(&m));
        gauge!("mesh_registry_managers", managers.len() as f64);
        info!(credential = %fingerprint(credential), managers = managers.len(), "mesh manager created");
        Ok(m)
    }

    /// Close and forget the manager for `credential`. Returns whether one existed.
    pub async fn delete(&self, credential: &str) -> bool {
        let mut managers = self.managers.lock().await;
        let Some(m) = managers.remove(credential) else {
            return false;
        };
        m.close();
        gauge!("mesh_registry_managers", managers.len() as f64);
        info!(credential = %fingerprint(credential), managers = managers.len(), "mesh manager closed");
        true
    }

    pub async fn len(&self) -> usize {
        self.managers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.managers.lock().await.is_empty()
    }

    /// Close every manager.
    pub async fn clear(&self) {
        let mut managers = self.managers.lock().await;
        for m in managers.values() {
            m.close();
        }
        managers.clear();
        gauge!("mesh_registry_managers", 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_hides_the_credential() {
        let a = fingerprint("apiVersion: v1\nkind: Config\n");
        assert_eq!(a, fingerprint("apiVersion: v1\nkind: Config\n"));
        assert_ne!(a, fingerprint("other"));
        assert_eq!(a.len(), 16);
        assert!(!a.contains("Config"));
    }

    #[tokio::test]
    async fn malformed_kubeconfig_is_a_validation_error() {
        let factory = KubeClientFactory::new("nocalhost");
        let err = factory.connect("clusters: [").await.err();
        assert!(matches!(err, Some(MeshError::Validation(_))));
    }
}

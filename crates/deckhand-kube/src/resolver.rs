//! Instance group manifest resolution
//!
//! The variable interpolation step writes one versioned secret per instance
//! group holding its fully resolved properties. The resolver reads the
//! latest version of it.

use deckhand_core::{Manifest, StoreConfig, names};

use crate::backend::SecretBackend;
use crate::error::{KubeError, Result};
use crate::store::VersionedSecretStore;

/// Data field holding the resolved instance group properties
pub const PROPERTIES_KEY: &str = "properties.yaml";

/// Read-only resolver for instance group manifests
#[derive(Clone)]
pub struct InstanceGroupResolver<B: SecretBackend> {
    store: VersionedSecretStore<B>,
}

impl<B: SecretBackend> InstanceGroupResolver<B> {
    pub fn new(backend: B, namespace: impl Into<String>) -> Self {
        Self {
            store: VersionedSecretStore::new(backend, namespace).with_payload_field(PROPERTIES_KEY),
        }
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.store = self.store.with_config(config);
        self
    }

    /// Latest resolved manifest of `instance_group` in `deployment`
    ///
    /// `NotFound` means no version was written yet; whether the instance
    /// group exists at all is up to the caller.
    pub async fn resolve(&self, deployment: &str, instance_group: &str) -> Result<Manifest> {
        let key = names::instance_group_key(deployment, instance_group);
        let stored = self.store.latest(&key).await?;

        Manifest::load_yaml(&stored.payload).map_err(|e| KubeError::Decode {
            name: stored.secret_name(),
            message: format!(
                "instance group manifest {}.{}: {}",
                deployment, instance_group, e
            ),
        })
    }
}

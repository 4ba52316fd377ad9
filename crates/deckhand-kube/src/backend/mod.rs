//! Backing API for versioned configuration
//!
//! Versions live in Kubernetes Secrets. The store only needs five primitives
//! from the backend:
//! - **create**: insert, failing with `Conflict` if the name is taken
//! - **get**: read by name
//! - **list**: all secrets of a namespace, optionally narrowed by a label selector
//! - **replace**: conditional on `metadata.resourceVersion` when set
//! - **delete**: remove by name

mod secrets;
pub(crate) mod memory;

pub use secrets::KubeSecretBackend;
pub use memory::{Fault, MemorySecretBackend, Operation, OperationCounts};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;

use crate::error::Result;

/// Storage primitives over named secrets
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Create a secret that must not exist yet
    async fn create(&self, secret: &Secret) -> Result<Secret>;

    /// Get a secret by name
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// List secrets of a namespace matching `label_selector`
    ///
    /// An empty selector lists every secret of the namespace.
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>>;

    /// Replace an existing secret
    async fn replace(&self, secret: &Secret) -> Result<Secret>;

    /// Delete a secret by name
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Namespace and name of a secret about to be written
pub(crate) fn secret_key(secret: &Secret) -> (String, String) {
    (
        secret.metadata.namespace.clone().unwrap_or_default(),
        secret.metadata.name.clone().unwrap_or_default(),
    )
}

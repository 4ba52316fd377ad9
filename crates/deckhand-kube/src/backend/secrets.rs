//! Kubernetes Secrets backend

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};

use super::{SecretBackend, secret_key};
use crate::error::{KubeError, Result};

const KIND: &str = "Secret";

/// Backend talking to the Kubernetes API
#[derive(Clone)]
pub struct KubeSecretBackend {
    client: Client,
}

impl KubeSecretBackend {
    /// Create a backend from the default kubeconfig / in-cluster config
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|source| KubeError::Upstream {
                operation: "connect to cluster".to_string(),
                source,
            })?;
        Ok(Self { client })
    }

    /// Create with an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn secrets_api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretBackend for KubeSecretBackend {
    async fn create(&self, secret: &Secret) -> Result<Secret> {
        let (namespace, name) = secret_key(secret);
        self.secrets_api(&namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| KubeError::from_api(e, "create", KIND, &namespace, &name))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secrets_api(namespace)
            .get(name)
            .await
            .map_err(|e| KubeError::from_api(e, "get", KIND, namespace, name))
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>> {
        let lp = if label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(label_selector)
        };
        let secrets = self
            .secrets_api(namespace)
            .list(&lp)
            .await
            .map_err(|e| KubeError::from_api(e, "list", KIND, namespace, label_selector))?;
        Ok(secrets.items)
    }

    async fn replace(&self, secret: &Secret) -> Result<Secret> {
        let (namespace, name) = secret_key(secret);
        // The API server rejects a stale resourceVersion with 409
        self.secrets_api(&namespace)
            .replace(&name, &PostParams::default(), secret)
            .await
            .map_err(|e| KubeError::from_api(e, "replace", KIND, &namespace, &name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.secrets_api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| KubeError::from_api(e, "delete", KIND, namespace, name))?;
        Ok(())
    }
}

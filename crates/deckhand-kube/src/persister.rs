//! Desired manifest persistence
//!
//! Each deployment has exactly one manifest, kept as a sequence of
//! immutable versions in the [`VersionedSecretStore`]. Persisting a changed
//! manifest adds a version; deleting the manifest removes every version.
//!
//! A source description records the provenance of each rendered manifest,
//! for example the custom resource that produced it.

use chrono::{DateTime, Utc};
use deckhand_core::{Manifest, StoreConfig, names};
use std::collections::BTreeMap;
use tracing::info;

use crate::annotations::{labels, secret};
use crate::backend::SecretBackend;
use crate::error::{KubeError, Result};
use crate::store::{ConfigVersion, VersionSelector, VersionedSecretStore};

/// Data field holding the serialized manifest
pub const MANIFEST_KEY: &str = "manifest";

/// One persisted version of a deployment manifest
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestRecord {
    pub deployment: String,
    pub version: u32,
    pub manifest: Manifest,
    pub source_description: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Persists the desired manifest of one deployment
#[derive(Clone)]
pub struct ManifestPersister<B: SecretBackend> {
    store: VersionedSecretStore<B>,
    deployment: String,
}

impl<B: SecretBackend> ManifestPersister<B> {
    pub fn new(backend: B, namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            store: VersionedSecretStore::new(backend, namespace).with_payload_field(MANIFEST_KEY),
            deployment: deployment.into(),
        }
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.store = self.store.with_config(config);
        self
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    fn logical_key(&self) -> String {
        names::deployment_key(&self.deployment)
    }

    /// Store `manifest` as the next version
    ///
    /// The manifest is fully serialized before the store is touched.
    pub async fn persist_manifest(
        &self,
        manifest: &Manifest,
        source_description: &str,
    ) -> Result<ManifestRecord> {
        let key = self.logical_key();
        let data = manifest.to_yaml().map_err(|e| KubeError::Decode {
            name: key.clone(),
            message: e.to_string(),
        })?;

        let version_labels =
            BTreeMap::from([(labels::DEPLOYMENT_NAME.to_string(), self.deployment.clone())]);
        let annotations = BTreeMap::from([(
            secret::SOURCE_DESCRIPTION.to_string(),
            source_description.to_string(),
        )]);

        let created = self.store.create(&key, data, version_labels, annotations).await?;
        info!(
            deployment = %self.deployment,
            version = created.version,
            source = source_description,
            "persisted manifest"
        );

        Ok(self.record(created, manifest.clone()))
    }

    /// Retrieve a specific version
    pub async fn retrieve_version(&self, version: u32) -> Result<ManifestRecord> {
        let stored = self.store.get_version(&self.logical_key(), version).await?;
        self.decode(stored)
    }

    /// Retrieve the latest version
    pub async fn retrieve_latest_version(&self) -> Result<ManifestRecord> {
        let stored = self.store.latest(&self.logical_key()).await?;
        self.decode(stored)
    }

    /// All versions, oldest first
    pub async fn list_all_versions(&self) -> Result<Vec<ManifestRecord>> {
        self.store
            .list_versions(&self.logical_key())
            .await?
            .into_iter()
            .map(|stored| self.decode(stored))
            .collect()
    }

    /// Add a label to the latest version
    pub async fn decorate_manifest(&self, key: &str, value: &str) -> Result<ManifestRecord> {
        let stored = self
            .store
            .label(&self.logical_key(), VersionSelector::Latest, key, value)
            .await?;
        self.decode(stored)
    }

    /// Remove all versions, and with them the manifest
    pub async fn delete_manifest(&self) -> Result<usize> {
        let deleted = self.store.delete_all(&self.logical_key()).await?;
        info!(deployment = %self.deployment, deleted, "deleted manifest");
        Ok(deleted)
    }

    fn decode(&self, stored: ConfigVersion) -> Result<ManifestRecord> {
        let manifest = Manifest::load_yaml(&stored.payload).map_err(|e| KubeError::Decode {
            name: stored.secret_name(),
            message: e.to_string(),
        })?;
        Ok(self.record(stored, manifest))
    }

    fn record(&self, stored: ConfigVersion, manifest: Manifest) -> ManifestRecord {
        ManifestRecord {
            deployment: self.deployment.clone(),
            version: stored.version,
            manifest,
            source_description: stored.annotations.get(secret::SOURCE_DESCRIPTION).cloned(),
            labels: stored.labels,
            created_at: stored.created_at,
        }
    }
}

//! Versioned secret store
//!
//! An immutable, versioned blob store keyed by a logical identifier. Version
//! `n` of key `k` lives in the secret `k-n`; versions form a contiguous
//! sequence starting at 1 and a version's payload never changes once created.
//!
//! There is no counter: the next version is derived by enumerating the
//! existing versions. Concurrent writers are resolved with create-only
//! inserts, and a writer that loses the race re-derives the version and
//! tries again, a bounded number of times.

use chrono::{DateTime, Utc};
use deckhand_core::StoreConfig;
use deckhand_core::names::{self, VersionPattern};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::annotations::labels;
use crate::backend::SecretBackend;
use crate::error::{KubeError, Result, with_deadline};

/// Data field holding the payload unless configured otherwise
pub const DEFAULT_PAYLOAD_FIELD: &str = "payload";

/// One immutable version of a logical key
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigVersion {
    pub logical_key: String,
    pub version: u32,
    pub payload: Vec<u8>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl ConfigVersion {
    /// Name of the secret backing this version
    pub fn secret_name(&self) -> String {
        format!("{}-{}", self.logical_key, self.version)
    }
}

/// Which version an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    Exact(u32),
}

/// Versioned store on top of a [`SecretBackend`]
#[derive(Clone)]
pub struct VersionedSecretStore<B: SecretBackend> {
    backend: B,
    namespace: String,
    payload_field: String,
    config: StoreConfig,
}

impl<B: SecretBackend> VersionedSecretStore<B> {
    pub fn new(backend: B, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            payload_field: DEFAULT_PAYLOAD_FIELD.to_string(),
            config: StoreConfig::default(),
        }
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Store payloads under `field` of the secret data
    pub fn with_payload_field(mut self, field: impl Into<String>) -> Self {
        self.payload_field = field.into();
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn payload_field(&self) -> &str {
        &self.payload_field
    }

    /// Create the next version of `logical_key`
    ///
    /// Fails with `Validation` before anything is written if the derived name
    /// is not a valid object name, and with `Conflict` once every attempt lost
    /// a version allocation race.
    pub async fn create(
        &self,
        logical_key: &str,
        payload: Vec<u8>,
        extra_labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<ConfigVersion> {
        let attempts = self.config.max_create_attempts.max(1);

        for attempt in 1..=attempts {
            let version = next_version(logical_key, self.greatest_version(logical_key).await?)?;
            let name = names::versioned_name(logical_key, version)?;
            let secret = self.build_secret(&name, version, &payload, &extra_labels, &annotations);

            let result = with_deadline(
                &format!("create Secret {}/{}", self.namespace, name),
                self.config.call_timeout,
                self.backend.create(&secret),
            )
            .await;

            match result {
                Ok(created) => {
                    debug!(namespace = %self.namespace, name = %name, version, "created version");
                    return self.to_version(logical_key, version, &created);
                }
                Err(e) if e.is_conflict() => {
                    warn!(
                        namespace = %self.namespace,
                        name = %name,
                        attempt,
                        attempts,
                        "version already taken, re-deriving"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(KubeError::Conflict {
            name: logical_key.to_string(),
            reason: format!("lost version allocation race {} times", attempts),
        })
    }

    /// Get a specific version
    pub async fn get_version(&self, logical_key: &str, version: u32) -> Result<ConfigVersion> {
        let name = names::versioned_name(logical_key, version)?;
        let secret = with_deadline(
            &format!("get Secret {}/{}", self.namespace, name),
            self.config.call_timeout,
            self.backend.get(&self.namespace, &name),
        )
        .await?;
        self.to_version(logical_key, version, &secret)
    }

    /// Get the greatest version
    pub async fn latest(&self, logical_key: &str) -> Result<ConfigVersion> {
        match self.greatest_version(logical_key).await? {
            0 => Err(KubeError::not_found("ConfigVersion", &self.namespace, logical_key)),
            version => self.get_version(logical_key, version).await,
        }
    }

    /// All versions of `logical_key`, ascending
    pub async fn list_versions(&self, logical_key: &str) -> Result<Vec<ConfigVersion>> {
        self.list_secrets(logical_key)
            .await?
            .iter()
            .map(|(version, secret)| self.to_version(logical_key, *version, secret))
            .collect()
    }

    /// Greatest existing version, 0 if there is none
    pub async fn greatest_version(&self, logical_key: &str) -> Result<u32> {
        Ok(self
            .list_secrets(logical_key)
            .await?
            .last()
            .map(|(version, _)| *version)
            .unwrap_or(0))
    }

    /// Delete every version of `logical_key`, returning how many were removed
    pub async fn delete_all(&self, logical_key: &str) -> Result<usize> {
        let mut deleted = 0;
        for (version, secret) in self.list_secrets(logical_key).await? {
            let name = secret.metadata.name.unwrap_or_default();
            let result = with_deadline(
                &format!("delete Secret {}/{}", self.namespace, name),
                self.config.call_timeout,
                self.backend.delete(&self.namespace, &name),
            )
            .await;

            match result {
                Ok(()) => {
                    debug!(namespace = %self.namespace, name = %name, version, "deleted version");
                    deleted += 1;
                }
                // Removed concurrently
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Attach or overwrite a label on an existing version
    ///
    /// The payload is left untouched. The update is conditional on the
    /// version read, a concurrent modification surfaces as `Conflict`.
    pub async fn label(
        &self,
        logical_key: &str,
        selector: VersionSelector,
        key: &str,
        value: &str,
    ) -> Result<ConfigVersion> {
        if key == labels::SECRET_KIND || key == labels::SECRET_VERSION {
            return Err(KubeError::Validation {
                name: key.to_string(),
                reason: "label is managed by the store".to_string(),
            });
        }

        let version = match selector {
            VersionSelector::Exact(version) => version,
            VersionSelector::Latest => match self.greatest_version(logical_key).await? {
                0 => return Err(KubeError::not_found("ConfigVersion", &self.namespace, logical_key)),
                version => version,
            },
        };

        let name = names::versioned_name(logical_key, version)?;
        let mut secret = with_deadline(
            &format!("get Secret {}/{}", self.namespace, name),
            self.config.call_timeout,
            self.backend.get(&self.namespace, &name),
        )
        .await?;

        secret
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());

        let updated = with_deadline(
            &format!("replace Secret {}/{}", self.namespace, name),
            self.config.call_timeout,
            self.backend.replace(&secret),
        )
        .await?;

        self.to_version(logical_key, version, &updated)
    }

    /// Secrets whose name is a version of `logical_key`, ascending
    ///
    /// The name alone decides membership. A matching secret written without
    /// the store's labels still occupies its version.
    async fn list_secrets(&self, logical_key: &str) -> Result<Vec<(u32, Secret)>> {
        let pattern = VersionPattern::new(logical_key)?;

        let secrets = with_deadline(
            &format!("list Secrets {}", self.namespace),
            self.config.call_timeout,
            self.backend.list(&self.namespace, ""),
        )
        .await?;

        let mut versions: Vec<(u32, Secret)> = secrets
            .into_iter()
            .filter_map(|s| {
                let version = s.metadata.name.as_deref().and_then(|n| pattern.version_of(n))?;
                Some((version, s))
            })
            .collect();
        versions.sort_by_key(|(version, _)| *version);
        Ok(versions)
    }

    fn build_secret(
        &self,
        name: &str,
        version: u32,
        payload: &[u8],
        extra_labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Secret {
        let mut all_labels = extra_labels.clone();
        all_labels.insert(
            labels::SECRET_KIND.to_string(),
            labels::SECRET_KIND_VERSIONED.to_string(),
        );
        all_labels.insert(labels::SECRET_VERSION.to_string(), version.to_string());

        let data = BTreeMap::from([(self.payload_field.clone(), ByteString(payload.to_vec()))]);

        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(all_labels),
                annotations: Some(annotations.clone()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    fn to_version(&self, logical_key: &str, version: u32, secret: &Secret) -> Result<ConfigVersion> {
        let payload = secret
            .data
            .as_ref()
            .and_then(|d| d.get(&self.payload_field))
            .map(|b| b.0.clone())
            .ok_or_else(|| KubeError::Decode {
                name: secret.metadata.name.clone().unwrap_or_default(),
                message: format!("secret has no '{}' data field", self.payload_field),
            })?;

        Ok(ConfigVersion {
            logical_key: logical_key.to_string(),
            version,
            payload,
            labels: secret.metadata.labels.clone().unwrap_or_default(),
            annotations: secret.metadata.annotations.clone().unwrap_or_default(),
            created_at: secret.metadata.creation_timestamp.as_ref().map(|t| t.0),
        })
    }
}

fn next_version(logical_key: &str, greatest: u32) -> Result<u32> {
    greatest.checked_add(1).ok_or_else(|| KubeError::Validation {
        name: logical_key.to_string(),
        reason: format!("version {} is the last one available", greatest),
    })
}

//! Reconciler and store tunables
//!
//! Values are supplied by the host (flags, environment, a config file). The
//! YAML form uses camelCase keys and humantime durations:
//!
//! ```yaml
//! namespace: cf
//! meltdownDuration: 1m
//! meltdownRequeueAfter: 30s
//! ctxTimeout: 30s
//! store:
//!   maxCreateAttempts: 5
//!   callTimeout: 10s
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Configuration of the entanglement reconciler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerConfig {
    /// Namespace watched by the controller
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Debounce window after a successful reconcile
    #[serde(default = "default_meltdown_duration", with = "humantime_serde")]
    pub meltdown_duration: Duration,

    /// Fixed re-check delay for deferred events
    ///
    /// When unset, a deferred event is re-checked exactly when its window closes.
    #[serde(default, with = "humantime_serde")]
    pub meltdown_requeue_after: Option<Duration>,

    /// Deadline for every call to the cluster
    #[serde(default = "default_ctx_timeout", with = "humantime_serde")]
    pub ctx_timeout: Duration,

    /// Versioned store settings
    #[serde(default)]
    pub store: StoreConfig,
}

/// Configuration of the versioned secret store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Create attempts before a version allocation race is reported
    #[serde(default = "default_max_create_attempts")]
    pub max_create_attempts: u32,

    /// Deadline for every call to the backing API
    #[serde(default = "default_ctx_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_meltdown_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_ctx_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_create_attempts() -> u32 {
    5
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            meltdown_duration: default_meltdown_duration(),
            meltdown_requeue_after: None,
            ctx_timeout: default_ctx_timeout(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_create_attempts: default_max_create_attempts(),
            call_timeout: default_ctx_timeout(),
        }
    }
}

impl ReconcilerConfig {
    /// Parse and validate configuration from YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(invalid("namespace must not be empty"));
        }
        if self.ctx_timeout.is_zero() {
            return Err(invalid("ctxTimeout must be greater than zero"));
        }
        if self.meltdown_requeue_after.is_some_and(|d| d.is_zero()) {
            return Err(invalid("meltdownRequeueAfter must be greater than zero"));
        }
        self.store.validate()
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_create_attempts == 0 {
            return Err(invalid("store.maxCreateAttempts must be at least 1"));
        }
        if self.call_timeout.is_zero() {
            return Err(invalid("store.callTimeout must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> CoreError {
    CoreError::InvalidConfig {
        message: message.to_string(),
    }
}

//! Error types for deckhand-kube

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Result type for deckhand-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while talking to the cluster
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Version, resource or owner absent
    #[error("{kind} '{name}' not found in namespace '{namespace}'")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Derived object name violates the naming rules
    #[error("invalid name '{name}': {reason}")]
    Validation { name: String, reason: String },

    /// Create or conditional update lost a race
    #[error("conflict on '{name}': {reason}")]
    Conflict { name: String, reason: String },

    /// Payload could not be serialized or deserialized
    #[error("failed to decode '{name}': {message}")]
    Decode { name: String, message: String },

    /// Deadline exceeded on an external call
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Any other Kubernetes API failure
    #[error("{operation} failed: {source}")]
    Upstream {
        operation: String,
        #[source]
        source: kube::Error,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of a [`KubeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    Decode,
    Timeout,
    Upstream,
    Config,
}

impl KubeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KubeError::NotFound { .. } => ErrorKind::NotFound,
            KubeError::Validation { .. } => ErrorKind::Validation,
            KubeError::Conflict { .. } => ErrorKind::Conflict,
            KubeError::Decode { .. } => ErrorKind::Decode,
            KubeError::Timeout { .. } => ErrorKind::Timeout,
            KubeError::Upstream { .. } => ErrorKind::Upstream,
            KubeError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub(crate) fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        KubeError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Classify a raw API error (404 and 409 get their own kinds)
    pub(crate) fn from_api(
        err: kube::Error,
        operation: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::not_found(kind, namespace, name),
            kube::Error::Api(resp) if resp.code == 409 => KubeError::Conflict {
                name: name.to_string(),
                reason: resp.message,
            },
            source => KubeError::Upstream {
                operation: format!("{} {} {}/{}", operation, kind, namespace, name),
                source,
            },
        }
    }
}

/// Decode failures are mapped where the object name is known
impl From<deckhand_core::CoreError> for KubeError {
    fn from(e: deckhand_core::CoreError) -> Self {
        match e {
            deckhand_core::CoreError::InvalidName { name, reason } => {
                KubeError::Validation { name, reason }
            }
            other => KubeError::Config(other.to_string()),
        }
    }
}

/// Run `fut` under a deadline, mapping expiry to [`KubeError::Timeout`]
pub(crate) async fn with_deadline<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(KubeError::Timeout {
            operation: operation.to_string(),
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_from_api_not_found() {
        let err = KubeError::from_api(api_error(404), "get", "Secret", "default", "s");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Secret 's' not found in namespace 'default'");
    }

    #[test]
    fn test_from_api_conflict() {
        let err = KubeError::from_api(api_error(409), "create", "Secret", "default", "s");
        assert!(err.is_conflict());
    }

    #[test]
    fn test_from_api_upstream_keeps_context() {
        let err = KubeError::from_api(api_error(500), "update", "StatefulSet", "cf", "nats");
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(err.to_string().starts_with("update StatefulSet cf/nats failed"));
    }

    #[test]
    fn test_from_core_invalid_name() {
        let core = deckhand_core::CoreError::InvalidName {
            name: "Bad".to_string(),
            reason: "uppercase".to_string(),
        };
        assert_eq!(KubeError::from(core).kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_from_core_config_error() {
        let core = deckhand_core::CoreError::InvalidConfig {
            message: "ctxTimeout must be greater than zero".to_string(),
        };
        let err = KubeError::from(core);
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("ctxTimeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_expires() {
        let result: Result<()> = with_deadline("get Pod default/p", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(KubeError::Timeout { after, .. }) if after == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result_through() {
        let result = with_deadline("get", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}

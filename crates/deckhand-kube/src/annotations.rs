//! Label and annotation keys written or read by Deckhand

use serde::Deserialize;
use std::collections::BTreeMap;

/// API group owning every key below
pub const GROUP_NAME: &str = "deckhand.io";

/// Labels on versioned secrets
pub mod labels {
    /// Marks a secret as one version of a logical key
    pub const SECRET_KIND: &str = "deckhand.io/secret-kind";
    /// Value of [`SECRET_KIND`] for versioned secrets
    pub const SECRET_KIND_VERSIONED: &str = "versioned";
    /// Version number, mirrors the name suffix
    pub const SECRET_VERSION: &str = "deckhand.io/secret-version";
    /// Deployment a manifest version belongs to
    pub const DEPLOYMENT_NAME: &str = "deckhand.io/deployment-name";
}

/// Annotations on versioned secrets
pub mod secret {
    /// Provenance of a rendered manifest
    pub const SOURCE_DESCRIPTION: &str = "deckhand.io/source-description";
}

/// Annotations on entangled pods and their owners
pub mod entanglement {
    /// Deployment whose links the pod consumes
    pub const DEPLOYMENT: &str = "deckhand.io/deployment-name";
    /// Links consumed by the pod
    pub const CONSUMES: &str = "deckhand.io/consumes";
    /// Written onto the owner's pod template to trigger a rollout
    pub const RESTART: &str = "deckhand.io/restart-by-entanglement";
    /// Versions of the consumed link secrets seen by the last restart
    pub const LINKS_VERSION: &str = "deckhand.io/consumed-links-version";
}

/// One entry of the consumes annotation, `{"name": "nats", "type": "nats"}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsumedLink {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Links listed in the consumes annotation
///
/// A missing or malformed annotation yields no links.
pub fn consumed_links(annotations: &BTreeMap<String, String>) -> Vec<ConsumedLink> {
    annotations
        .get(entanglement::CONSUMES)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

/// Whether the annotations still declare an entanglement
///
/// Both the deployment and the consumed links must be present and non-empty.
pub fn has_entanglement(annotations: &BTreeMap<String, String>) -> bool {
    let present = |key: &str| annotations.get(key).is_some_and(|v| !v.trim().is_empty());
    present(entanglement::DEPLOYMENT) && present(entanglement::CONSUMES)
}

/// Annotation map triggering a restart at `unix_seconds`
pub fn restart_annotation(unix_seconds: i64) -> BTreeMap<String, String> {
    BTreeMap::from([(entanglement::RESTART.to_string(), unix_seconds.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_valid_entanglement() {
        let a = annotations(&[
            (entanglement::DEPLOYMENT, "nats"),
            (entanglement::CONSUMES, r#"[{"name":"nats","type":"nats"}]"#),
        ]);
        assert!(has_entanglement(&a));
    }

    #[test]
    fn test_missing_consumes() {
        let a = annotations(&[(entanglement::DEPLOYMENT, "nats")]);
        assert!(!has_entanglement(&a));
    }

    #[test]
    fn test_blank_deployment() {
        let a = annotations(&[(entanglement::DEPLOYMENT, " "), (entanglement::CONSUMES, "x")]);
        assert!(!has_entanglement(&a));
    }

    #[test]
    fn test_consumed_links() {
        let a = annotations(&[(
            entanglement::CONSUMES,
            r#"[{"name":"nats","type":"nats"},{"name":"router"}]"#,
        )]);
        let links = consumed_links(&a);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].kind, "nats");
        assert_eq!(links[1].name, "router");
        assert!(links[1].kind.is_empty());
    }

    #[test]
    fn test_malformed_consumes_has_no_links() {
        assert!(consumed_links(&annotations(&[(entanglement::CONSUMES, "nats.nats")])).is_empty());
        assert!(consumed_links(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_restart_annotation_value() {
        let a = restart_annotation(1_700_000_000);
        assert_eq!(a.get(entanglement::RESTART), Some(&"1700000000".to_string()));
        assert!(entanglement::RESTART.starts_with(GROUP_NAME));
    }
}

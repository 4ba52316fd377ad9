//! Naming scheme for versioned secrets
//!
//! Every version of a logical key is stored under `<logical_key>-<version>`.
//! Names must satisfy the Kubernetes DNS subdomain rules.

use regex::Regex;

use crate::error::{CoreError, Result};

/// Maximum length of a Kubernetes object name
pub const MAX_NAME_LENGTH: usize = 253;

/// Logical key of the desired manifest of a deployment
pub fn deployment_key(deployment: &str) -> String {
    format!("deployment-{}", deployment)
}

/// Logical key of the resolved properties of one instance group
pub fn instance_group_key(deployment: &str, instance_group: &str) -> String {
    format!("{}.ig-resolved.{}", deployment, instance_group)
}

/// Secret providing link `link` of `deployment` to its consumers
pub fn link_secret_name(deployment: &str, link: &str) -> String {
    format!("link-{}-{}", deployment, link)
}

/// Check a proposed object name against length and charset rules
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(CoreError::InvalidName {
            name: name.to_string(),
            reason: format!(
                "exceeds maximum number of allowed characters (actual={}, allowed={})",
                name.len(),
                MAX_NAME_LENGTH
            ),
        });
    }

    if name
        .chars()
        .any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-'))
    {
        return Err(CoreError::InvalidName {
            name: name.to_string(),
            reason: "contains invalid characters, only lower case, digits, dot and dash are allowed"
                .to_string(),
        });
    }

    Ok(())
}

/// Build and validate the name of one version of a logical key
pub fn versioned_name(logical_key: &str, version: u32) -> Result<String> {
    let name = format!("{}-{}", logical_key, version);
    validate_name(&name)?;
    Ok(name)
}

/// Matches the names belonging to exactly one logical key
#[derive(Debug, Clone)]
pub struct VersionPattern {
    regex: Regex,
}

impl VersionPattern {
    pub fn new(logical_key: &str) -> Result<Self> {
        let pattern = format!(r"^{}-(\d+)$", regex::escape(logical_key));
        let regex = Regex::new(&pattern).map_err(|e| CoreError::InvalidName {
            name: logical_key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { regex })
    }

    /// Version encoded in `name`, if it belongs to this key
    pub fn version_of(&self, name: &str) -> Option<u32> {
        self.regex
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    pub fn matches(&self, name: &str) -> bool {
        self.version_of(name).is_some()
    }
}

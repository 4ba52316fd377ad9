//! Object graph: pods, their controllers, and ownership edges
//!
//! The reconciler reads pods and the secrets they consume, follows owner
//! references to workload controllers and writes annotations back. [`ObjectGraph`] is the seam
//! between that logic and the cluster.

mod cluster;
mod memory;

pub use cluster::KubeObjectGraph;
pub use memory::{GraphFault, GraphOperation, MemoryObjectGraph};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{KubeError, Result};

/// Workload controller kinds the reconciler knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkloadKind {
    StatefulSet,
    ReplicaSet,
    Deployment,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::Deployment => "Deployment",
        }
    }
}

/// How a pod owner of a given kind leads to the workload that gets touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The owner itself is touched
    Direct,
    /// The owner's own owner of this kind is touched, one hop up
    ViaOwner(WorkloadKind),
}

impl WorkloadKind {
    /// Recognized owner kind, `None` for anything else
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "ReplicaSet" => Some(WorkloadKind::ReplicaSet),
            "Deployment" => Some(WorkloadKind::Deployment),
            _ => None,
        }
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            WorkloadKind::StatefulSet | WorkloadKind::Deployment => Resolution::Direct,
            WorkloadKind::ReplicaSet => Resolution::ViaOwner(WorkloadKind::Deployment),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ownership edge `{kind, name}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerEdge {
    pub kind: String,
    pub name: String,
}

impl OwnerEdge {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for OwnerEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl From<&OwnerReference> for OwnerEdge {
    fn from(or: &OwnerReference) -> Self {
        Self::new(or.kind.clone(), or.name.clone())
    }
}

/// Ownership edges found in object metadata
pub fn owner_edges(metadata: &ObjectMeta) -> Vec<OwnerEdge> {
    metadata
        .owner_references
        .iter()
        .flatten()
        .map(OwnerEdge::from)
        .collect()
}

/// A workload controller object
#[derive(Debug, Clone)]
pub enum Workload {
    StatefulSet(StatefulSet),
    ReplicaSet(ReplicaSet),
    Deployment(Deployment),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::ReplicaSet(_) => WorkloadKind::ReplicaSet,
            Workload::Deployment(_) => WorkloadKind::Deployment,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::StatefulSet(o) => &o.metadata,
            Workload::ReplicaSet(o) => &o.metadata,
            Workload::Deployment(o) => &o.metadata,
        }
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::StatefulSet(o) => &mut o.metadata,
            Workload::ReplicaSet(o) => &mut o.metadata,
            Workload::Deployment(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    pub fn owner_edges(&self) -> Vec<OwnerEdge> {
        owner_edges(self.metadata())
    }

    fn template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::StatefulSet(o) => o.spec.as_ref().map(|s| &s.template),
            Workload::ReplicaSet(o) => o.spec.as_ref().and_then(|s| s.template.as_ref()),
            Workload::Deployment(o) => o.spec.as_ref().map(|s| &s.template),
        }
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        match self {
            Workload::StatefulSet(o) => o.spec.as_mut().map(|s| &mut s.template),
            Workload::ReplicaSet(o) => o.spec.as_mut().and_then(|s| s.template.as_mut()),
            Workload::Deployment(o) => o.spec.as_mut().map(|s| &mut s.template),
        }
    }

    /// Annotations of the pod template
    pub fn template_annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
    }

    /// Merge `annotations` into the pod template metadata
    pub fn merge_template_annotations(&mut self, annotations: BTreeMap<String, String>) -> Result<()> {
        let kind = self.kind();
        let name = self.name().to_string();
        let template = self.template_mut().ok_or_else(|| KubeError::Decode {
            name: format!("{}/{}", kind, name),
            message: "workload has no pod template".to_string(),
        })?;

        template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations);
        Ok(())
    }
}

/// Access to the objects the reconciler reads and writes
#[async_trait]
pub trait ObjectGraph: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Update a pod, conditional on its `resourceVersion`
    async fn update_pod(&self, pod: &Pod) -> Result<Pod>;

    async fn get_workload(&self, namespace: &str, kind: WorkloadKind, name: &str) -> Result<Workload>;

    /// Update a workload, conditional on its `resourceVersion`
    async fn update_workload(&self, workload: &Workload) -> Result<Workload>;

    /// Get a secret consumed by pods
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{ReplicaSetSpec, StatefulSetSpec};

    fn statefulset(template_annotations: Option<BTreeMap<String, String>>) -> Workload {
        Workload::StatefulSet(StatefulSet {
            metadata: ObjectMeta {
                name: Some("nats".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                template: PodTemplateSpec {
                    metadata: template_annotations.map(|a| ObjectMeta {
                        annotations: Some(a),
                        ..Default::default()
                    }),
                    spec: None,
                },
                ..Default::default()
            }),
            status: None,
        })
    }

    #[test]
    fn test_merge_into_empty_template() {
        let mut sts = statefulset(None);
        sts.merge_template_annotations(BTreeMap::from([("a".to_string(), "1".to_string())]))
            .unwrap();
        assert_eq!(sts.template_annotations().unwrap().get("a"), Some(&"1".to_string()));
    }

    #[test]
    fn test_merge_keeps_existing_annotations() {
        let existing = BTreeMap::from([
            ("keep".to_string(), "yes".to_string()),
            ("a".to_string(), "old".to_string()),
        ]);
        let mut sts = statefulset(Some(existing));
        sts.merge_template_annotations(BTreeMap::from([("a".to_string(), "new".to_string())]))
            .unwrap();

        let annotations = sts.template_annotations().unwrap();
        assert_eq!(annotations.get("keep"), Some(&"yes".to_string()));
        assert_eq!(annotations.get("a"), Some(&"new".to_string()));
    }

    #[test]
    fn test_merge_without_template_fails() {
        let mut rs = Workload::ReplicaSet(ReplicaSet {
            metadata: ObjectMeta {
                name: Some("nats-abc".to_string()),
                ..Default::default()
            },
            spec: Some(ReplicaSetSpec::default()),
            status: None,
        });
        assert!(rs.merge_template_annotations(BTreeMap::new()).is_err());
    }

    #[test]
    fn test_kind_resolution() {
        assert_eq!(WorkloadKind::parse("StatefulSet").unwrap().resolution(), Resolution::Direct);
        assert_eq!(
            WorkloadKind::parse("ReplicaSet").unwrap().resolution(),
            Resolution::ViaOwner(WorkloadKind::Deployment)
        );
        assert_eq!(WorkloadKind::parse("DaemonSet"), None);
        assert_eq!(WorkloadKind::parse("statefulset"), None);
    }

    #[test]
    fn test_owner_edges() {
        let metadata = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "ReplicaSet".to_string(),
                name: "nats-abc".to_string(),
                uid: "1".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(owner_edges(&metadata), vec![OwnerEdge::new("ReplicaSet", "nats-abc")]);
        assert!(owner_edges(&ObjectMeta::default()).is_empty());
    }
}

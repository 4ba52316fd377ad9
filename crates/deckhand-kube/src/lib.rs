//! Deckhand Kube - Kubernetes integration for Deckhand
//!
//! This crate provides:
//! - **Versioned Store**: immutable, numbered configuration versions kept in Secrets
//! - **Manifest Persister**: desired deployment manifests on top of the store
//! - **Instance Group Resolver**: latest resolved properties per instance group
//! - **Entanglement Reconciler**: restarts the workloads owning entangled pods
//! - **Controller**: runs the reconciler against a live cluster
//! - **Backends**: Kubernetes and in-memory implementations of the secret and
//!   object graph seams

pub mod annotations;
pub mod backend;
pub mod controller;
pub mod entanglement;
pub mod error;
pub mod graph;
pub mod persister;
pub mod resolver;
pub mod store;

pub use backend::{Fault, KubeSecretBackend, MemorySecretBackend, Operation, OperationCounts, SecretBackend};
pub use entanglement::{EntanglementReconciler, ReconcileOutcome, consumes_secret};
pub use error::{ErrorKind, KubeError, Result};
pub use graph::{
    GraphFault, GraphOperation, KubeObjectGraph, MemoryObjectGraph, ObjectGraph, OwnerEdge,
    Resolution, Workload, WorkloadKind,
};
pub use persister::{MANIFEST_KEY, ManifestPersister, ManifestRecord};
pub use resolver::{InstanceGroupResolver, PROPERTIES_KEY};
pub use store::{ConfigVersion, VersionSelector, VersionedSecretStore};

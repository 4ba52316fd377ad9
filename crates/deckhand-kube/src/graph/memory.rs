//! In-memory object graph for testing

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{ObjectGraph, OwnerEdge, Workload, WorkloadKind};
use crate::backend::memory::status_error;
use crate::error::{KubeError, Result};

/// Graph operation, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphOperation {
    GetPod,
    UpdatePod,
    GetWorkload,
    UpdateWorkload,
    GetSecret,
}

impl GraphOperation {
    fn verb(&self) -> &'static str {
        match self {
            GraphOperation::GetPod | GraphOperation::GetWorkload | GraphOperation::GetSecret => {
                "get"
            }
            GraphOperation::UpdatePod | GraphOperation::UpdateWorkload => "update",
        }
    }
}

/// A failure to inject into the next call of an operation
#[derive(Debug, Clone, Copy)]
pub enum GraphFault {
    /// Answer with an API error carrying this HTTP status
    Status(u16),
    /// Stall before answering
    Delay(Duration),
}

#[derive(Default)]
struct State {
    pods: BTreeMap<(String, String), Pod>,
    workloads: BTreeMap<(WorkloadKind, String, String), Workload>,
    secrets: BTreeMap<(String, String), Secret>,
    next_resource_version: u64,
    workload_updates: Vec<OwnerEdge>,
    pod_updates: usize,
    faults: HashMap<GraphOperation, VecDeque<GraphFault>>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }
}

/// In-memory graph, clones share the same state
#[derive(Clone, Default)]
pub struct MemoryObjectGraph {
    state: Arc<Mutex<State>>,
}

fn pod_key(pod: &Pod) -> (String, String) {
    (
        pod.metadata.namespace.clone().unwrap_or_default(),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

fn workload_key(workload: &Workload) -> (WorkloadKind, String, String) {
    (
        workload.kind(),
        workload.namespace().to_string(),
        workload.name().to_string(),
    )
}

impl MemoryObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, mut pod: Pod) {
        let mut state = self.lock();
        pod.metadata.resource_version = Some(state.bump());
        state.pods.insert(pod_key(&pod), pod);
    }

    pub fn add_workload(&self, mut workload: Workload) {
        let mut state = self.lock();
        workload.metadata_mut().resource_version = Some(state.bump());
        state.workloads.insert(workload_key(&workload), workload);
    }

    /// Add a secret, or replace it with a new resource version
    pub fn put_secret(&self, mut secret: Secret) {
        let mut state = self.lock();
        secret.metadata.resource_version = Some(state.bump());
        let key = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        state.secrets.insert(key, secret);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.lock()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Option<Workload> {
        self.lock()
            .workloads
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Workloads updated so far, in order
    pub fn workload_updates(&self) -> Vec<OwnerEdge> {
        self.lock().workload_updates.clone()
    }

    pub fn pod_updates(&self) -> usize {
        self.lock().pod_updates
    }

    /// Queue a fault for the next call of `operation`
    pub fn inject(&self, operation: GraphOperation, fault: GraphFault) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, operation: GraphOperation, kind: &str, namespace: &str, name: &str) -> Result<()> {
        let fault = self
            .lock()
            .faults
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());

        match fault {
            None => Ok(()),
            Some(GraphFault::Status(code)) => Err(KubeError::from_api(
                status_error(code),
                operation.verb(),
                kind,
                namespace,
                name,
            )),
            Some(GraphFault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

fn check_version(current: Option<&String>, expected: Option<&String>, name: &str) -> Result<()> {
    match expected {
        Some(expected) if current != Some(expected) => Err(KubeError::Conflict {
            name: name.to_string(),
            reason: "the object has been modified".to_string(),
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl ObjectGraph for MemoryObjectGraph {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.enter(GraphOperation::GetPod, "Pod", namespace, name).await?;
        self.pod(namespace, name)
            .ok_or_else(|| KubeError::not_found("Pod", namespace, name))
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod> {
        let (namespace, name) = pod_key(pod);
        self.enter(GraphOperation::UpdatePod, "Pod", &namespace, &name).await?;

        let mut state = self.lock();
        let current = state
            .pods
            .get(&(namespace.clone(), name.clone()))
            .ok_or_else(|| KubeError::not_found("Pod", &namespace, &name))?;
        check_version(
            current.metadata.resource_version.as_ref(),
            pod.metadata.resource_version.as_ref(),
            &name,
        )?;

        let mut pod = pod.clone();
        pod.metadata.resource_version = Some(state.bump());
        state.pod_updates += 1;
        state.pods.insert((namespace, name), pod.clone());
        Ok(pod)
    }

    async fn get_workload(&self, namespace: &str, kind: WorkloadKind, name: &str) -> Result<Workload> {
        self.enter(GraphOperation::GetWorkload, kind.as_str(), namespace, name).await?;
        self.workload(kind, namespace, name)
            .ok_or_else(|| KubeError::not_found(kind.as_str(), namespace, name))
    }

    async fn update_workload(&self, workload: &Workload) -> Result<Workload> {
        let key = workload_key(workload);
        let kind = key.0.as_str();
        self.enter(GraphOperation::UpdateWorkload, kind, &key.1, &key.2).await?;

        let mut state = self.lock();
        let current = state
            .workloads
            .get(&key)
            .ok_or_else(|| KubeError::not_found(kind, &key.1, &key.2))?;
        check_version(
            current.metadata().resource_version.as_ref(),
            workload.metadata().resource_version.as_ref(),
            &key.2,
        )?;

        let mut workload = workload.clone();
        workload.metadata_mut().resource_version = Some(state.bump());
        state.workload_updates.push(OwnerEdge::new(kind, key.2.clone()));
        state.workloads.insert(key, workload.clone());
        Ok(workload)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.enter(GraphOperation::GetSecret, "Secret", namespace, name).await?;
        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| KubeError::not_found("Secret", namespace, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_update_bumps_resource_version() {
        let graph = MemoryObjectGraph::new();
        graph.add_workload(Workload::StatefulSet(StatefulSet {
            metadata: meta("nats"),
            ..Default::default()
        }));

        let sts = graph.get_workload("default", WorkloadKind::StatefulSet, "nats").await.unwrap();
        let updated = graph.update_workload(&sts).await.unwrap();
        assert_ne!(updated.metadata().resource_version, sts.metadata().resource_version);
        assert_eq!(graph.workload_updates(), vec![OwnerEdge::new("StatefulSet", "nats")]);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let graph = MemoryObjectGraph::new();
        graph.add_pod(Pod {
            metadata: meta("nats-0"),
            ..Default::default()
        });

        let pod = graph.get_pod("default", "nats-0").await.unwrap();
        graph.update_pod(&pod).await.unwrap();

        let err = graph.update_pod(&pod).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(graph.pod_updates(), 1);
    }

    #[tokio::test]
    async fn test_missing_objects() {
        let graph = MemoryObjectGraph::new();
        assert!(graph.get_pod("default", "nats-0").await.unwrap_err().is_not_found());
        assert!(
            graph
                .get_workload("default", WorkloadKind::Deployment, "nats")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_removed_pod_is_gone() {
        let graph = MemoryObjectGraph::new();
        graph.add_pod(Pod {
            metadata: meta("nats-0"),
            ..Default::default()
        });
        graph.remove_pod("default", "nats-0");

        assert!(graph.get_pod("default", "nats-0").await.unwrap_err().is_not_found());
        assert!(graph.pod("default", "nats-0").is_none());
    }

    #[tokio::test]
    async fn test_put_secret_bumps_resource_version() {
        let graph = MemoryObjectGraph::new();
        graph.put_secret(Secret {
            metadata: meta("link-nats-nats"),
            ..Default::default()
        });
        let first = graph.get_secret("default", "link-nats-nats").await.unwrap();

        graph.put_secret(first.clone());
        let second = graph.get_secret("default", "link-nats-nats").await.unwrap();
        assert_ne!(first.metadata.resource_version, second.metadata.resource_version);
        assert!(graph.get_secret("default", "link-nats-other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_status() {
        let graph = MemoryObjectGraph::new();
        graph.add_pod(Pod {
            metadata: meta("nats-0"),
            ..Default::default()
        });
        graph.inject(GraphOperation::GetPod, GraphFault::Status(500));

        let err = graph.get_pod("default", "nats-0").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Upstream);
        assert!(graph.get_pod("default", "nats-0").await.is_ok());
    }
}

//! Object graph backed by the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::Client;
use kube::api::{Api, PostParams};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use super::{ObjectGraph, Workload, WorkloadKind};
use crate::error::{KubeError, Result};

#[derive(Clone)]
pub struct KubeObjectGraph {
    client: Client,
}

impl KubeObjectGraph {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| KubeError::from_api(e, "get", &K::kind(&()), namespace, name))
    }

    /// Replace `object`; a stale `resourceVersion` is rejected with 409
    async fn replace<K>(&self, object: &K) -> Result<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let namespace = object.meta().namespace.clone().unwrap_or_default();
        let name = object.meta().name.clone().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| KubeError::from_api(e, "update", &K::kind(&()), &namespace, &name))
    }
}

#[async_trait]
impl ObjectGraph for KubeObjectGraph {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.get(namespace, name).await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod> {
        self.replace(pod).await
    }

    async fn get_workload(&self, namespace: &str, kind: WorkloadKind, name: &str) -> Result<Workload> {
        Ok(match kind {
            WorkloadKind::StatefulSet => Workload::StatefulSet(self.get::<StatefulSet>(namespace, name).await?),
            WorkloadKind::ReplicaSet => Workload::ReplicaSet(self.get::<ReplicaSet>(namespace, name).await?),
            WorkloadKind::Deployment => Workload::Deployment(self.get::<Deployment>(namespace, name).await?),
        })
    }

    async fn update_workload(&self, workload: &Workload) -> Result<Workload> {
        Ok(match workload {
            Workload::StatefulSet(o) => Workload::StatefulSet(self.replace(o).await?),
            Workload::ReplicaSet(o) => Workload::ReplicaSet(self.replace(o).await?),
            Workload::Deployment(o) => Workload::Deployment(self.replace(o).await?),
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.get(namespace, name).await
    }
}

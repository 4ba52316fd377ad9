//! Entanglement restarts
//!
//! A pod that consumes links of another deployment carries the entanglement
//! annotations. When the link secrets it consumes change, the workload
//! controller owning it gets a restart annotation on its pod template, which
//! rolls the pods.
//!
//! Whether anything changed is decided by the links version: the resource
//! versions of the consumed link secrets, recorded on the pod and on the
//! owner's pod template at every restart. Pods recreated by the rollout
//! inherit it from the template, so neither they nor the reconciler's own
//! writes cause another restart.
//!
//! The walk from pod to workload is table driven, see
//! [`WorkloadKind::resolution`]: a StatefulSet is touched directly, a
//! ReplicaSet is skipped over in favour of its Deployment. Reconciles within
//! the meltdown window of the previous one are deferred.

use chrono::{DateTime, Utc};
use deckhand_core::names::link_secret_name;
use deckhand_core::{Clock, MeltdownWindow, ReconcilerConfig, SystemClock, set_last_reconcile};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::annotations::{
    ConsumedLink, consumed_links, entanglement, has_entanglement, restart_annotation,
};
use crate::error::{Result, with_deadline};
use crate::graph::{ObjectGraph, OwnerEdge, Resolution, Workload, WorkloadKind, owner_edges};

/// Result of one reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The pod disappeared before it was processed
    PodGone,
    /// Within the meltdown window, check again later
    Meltdown { requeue_after: Duration },
    /// The pod no longer declares an entanglement
    NotEntangled,
    /// First sight of the pod, its links version was recorded
    Baseline,
    /// The consumed links did not change since the last restart
    UpToDate,
    /// Owners were restarted
    Restarted {
        touched: Vec<OwnerEdge>,
        /// Whether the last-reconcile stamp was persisted
        stamped: bool,
    },
}

impl ReconcileOutcome {
    /// Scheduling decision for the controller runtime
    pub fn action(&self) -> Action {
        match self {
            ReconcileOutcome::Meltdown { requeue_after } => Action::requeue(*requeue_after),
            _ => Action::await_change(),
        }
    }
}

/// Whether `pod` consumes the link secret `namespace/secret_name`
pub fn consumes_secret(pod: &Pod, namespace: &str, secret_name: &str) -> bool {
    let Some(annotations) = pod.metadata.annotations.as_ref() else {
        return false;
    };
    if pod.metadata.namespace.as_deref() != Some(namespace) || !has_entanglement(annotations) {
        return false;
    }

    let deployment = annotations
        .get(entanglement::DEPLOYMENT)
        .map(String::as_str)
        .unwrap_or_default();
    consumed_links(annotations)
        .iter()
        .any(|link| link_secret_name(deployment, &link.name) == secret_name)
}

/// Restarts the workloads owning entangled pods
pub struct EntanglementReconciler<G: ObjectGraph, C: Clock = SystemClock> {
    graph: G,
    clock: C,
    config: ReconcilerConfig,
}

impl<G: ObjectGraph> EntanglementReconciler<G> {
    pub fn new(graph: G, config: ReconcilerConfig) -> Self {
        Self::with_clock(graph, SystemClock, config)
    }
}

impl<G: ObjectGraph, C: Clock> EntanglementReconciler<G, C> {
    pub fn with_clock(graph: G, clock: C, config: ReconcilerConfig) -> Self {
        Self {
            graph,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconcile the pod `namespace/name`
    ///
    /// Errors are only returned for owner lookups or updates that failed for
    /// a reason other than NotFound, or when reading the pod or its link
    /// secrets failed.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        info!(namespace, name, "reconciling entangled pod");
        let timeout = self.config.ctx_timeout;

        let mut pod = match with_deadline("get pod", timeout, self.graph.get_pod(namespace, name)).await
        {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                debug!(namespace, name, "skip reconcile: pod not found");
                return Ok(ReconcileOutcome::PodGone);
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();

        let window = MeltdownWindow::from_annotations(self.config.meltdown_duration, &annotations);
        if let Some(remaining) = window.remaining(now) {
            let requeue_after = self.config.meltdown_requeue_after.unwrap_or(remaining);
            debug!(
                namespace,
                name,
                requeue_after = ?requeue_after,
                "pod is in meltdown, deferring reconcile"
            );
            return Ok(ReconcileOutcome::Meltdown { requeue_after });
        }

        if !has_entanglement(&annotations) {
            debug!(namespace, name, "skip reconcile: entanglement annotations gone");
            return Ok(ReconcileOutcome::NotEntangled);
        }

        let deployment = annotations
            .get(entanglement::DEPLOYMENT)
            .map(String::as_str)
            .unwrap_or_default();
        let links_version = self
            .links_version(namespace, deployment, &consumed_links(&annotations))
            .await?;

        match annotations.get(entanglement::LINKS_VERSION) {
            None => {
                debug!(namespace, name, links_version = %links_version, "recording links version");
                self.record(&mut pod, &links_version, None).await;
                return Ok(ReconcileOutcome::Baseline);
            }
            Some(seen) if *seen == links_version => {
                debug!(namespace, name, "skip reconcile: consumed links unchanged");
                return Ok(ReconcileOutcome::UpToDate);
            }
            Some(_) => {}
        }

        let mut restart = restart_annotation(now.timestamp());
        restart.insert(entanglement::LINKS_VERSION.to_string(), links_version.clone());
        set_last_reconcile(&mut restart, now);

        let mut touched = Vec::new();
        for edge in owner_edges(&pod.metadata) {
            if let Some(target) = self
                .touch_owner(namespace, &edge, &restart, &links_version, &touched)
                .await?
            {
                touched.push(target);
            }
        }

        let stamped = self.record(&mut pod, &links_version, Some(now)).await;
        Ok(ReconcileOutcome::Restarted { touched, stamped })
    }

    /// Resource versions of the consumed link secrets, in name order
    ///
    /// A missing secret is recorded as `-`, so its creation counts as a change.
    async fn links_version(
        &self,
        namespace: &str,
        deployment: &str,
        links: &[ConsumedLink],
    ) -> Result<String> {
        let secret_names: BTreeSet<String> = links
            .iter()
            .map(|link| link_secret_name(deployment, &link.name))
            .collect();

        let mut parts = Vec::with_capacity(secret_names.len());
        for secret_name in secret_names {
            let get = self.graph.get_secret(namespace, &secret_name);
            let version = match with_deadline("get link secret", self.config.ctx_timeout, get).await {
                Ok(secret) => secret.metadata.resource_version.unwrap_or_default(),
                Err(e) if e.is_not_found() => "-".to_string(),
                Err(e) => return Err(e),
            };
            parts.push(format!("{}={}", secret_name, version));
        }
        Ok(parts.join(","))
    }

    /// Touch the workload reached from one pod owner
    ///
    /// Returns the touched workload, or `None` when the path ended in a
    /// missing object or an unrecognized kind, or the workload was already
    /// restarted for `links_version`.
    async fn touch_owner(
        &self,
        namespace: &str,
        edge: &OwnerEdge,
        restart: &BTreeMap<String, String>,
        links_version: &str,
        touched: &[OwnerEdge],
    ) -> Result<Option<OwnerEdge>> {
        let Some(kind) = WorkloadKind::parse(&edge.kind) else {
            debug!(namespace, owner = %edge, "ignoring owner of unrecognized kind");
            return Ok(None);
        };

        let target = match kind.resolution() {
            Resolution::Direct => self.fetch(namespace, kind, &edge.name).await?,
            Resolution::ViaOwner(parent_kind) => {
                let Some(intermediate) = self.fetch(namespace, kind, &edge.name).await? else {
                    return Ok(None);
                };
                let parent = intermediate
                    .owner_edges()
                    .into_iter()
                    .find(|e| WorkloadKind::parse(&e.kind) == Some(parent_kind));
                match parent {
                    Some(parent) => self.fetch(namespace, parent_kind, &parent.name).await?,
                    None => {
                        debug!(namespace, owner = %edge, "no {} owns this {}", parent_kind, kind);
                        None
                    }
                }
            }
        };

        let Some(mut workload) = target else {
            return Ok(None);
        };

        let target = OwnerEdge::new(workload.kind().as_str(), workload.name());
        if touched.contains(&target) {
            return Ok(None);
        }
        let restarted_for = workload
            .template_annotations()
            .and_then(|a| a.get(entanglement::LINKS_VERSION));
        if restarted_for.is_some_and(|v| v == links_version) {
            debug!(namespace, owner = %target, "owner already restarted for these links");
            return Ok(None);
        }

        workload.merge_template_annotations(restart.clone())?;
        let update = self.graph.update_workload(&workload);
        match with_deadline("update owner", self.config.ctx_timeout, update).await {
            Ok(_) => {
                info!(namespace, owner = %target, "restarted owner of entangled pod");
                Ok(Some(target))
            }
            Err(e) if e.is_not_found() => {
                debug!(namespace, owner = %target, "owner vanished before update");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Get a workload, `None` if it does not exist
    async fn fetch(&self, namespace: &str, kind: WorkloadKind, name: &str) -> Result<Option<Workload>> {
        let get = self.graph.get_workload(namespace, kind, name);
        match with_deadline("get owner", self.config.ctx_timeout, get).await {
            Ok(workload) => Ok(Some(workload)),
            Err(e) if e.is_not_found() => {
                debug!(namespace, owner = %OwnerEdge::new(kind.as_str(), name), "owner not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Record the links version, and `reconciled_at` when given, on the pod
    ///
    /// Failures are logged, never returned.
    async fn record(&self, pod: &mut Pod, links_version: &str, reconciled_at: Option<DateTime<Utc>>) -> bool {
        let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(entanglement::LINKS_VERSION.to_string(), links_version.to_string());
        if let Some(now) = reconciled_at {
            set_last_reconcile(annotations, now);
        }

        let name = pod.metadata.name.clone().unwrap_or_default();
        match with_deadline("update pod", self.config.ctx_timeout, self.graph.update_pod(pod)).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    name = %name,
                    resource_version = pod.metadata.resource_version.as_deref().unwrap_or_default(),
                    error = %e,
                    "failed to update reconcile annotations on entangled pod"
                );
                false
            }
        }
    }
}

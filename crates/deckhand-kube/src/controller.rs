//! Controller runtime wiring for the entanglement reconciler
//!
//! Reconciles are triggered by changes of link secrets. Each secret event is
//! mapped to the entangled pods consuming it, looked up in the controller's
//! pod cache. Pod events still reach the reconciler, which sorts out the ones
//! without a link change.

use deckhand_core::ReconcilerConfig;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::annotations::has_entanglement;
use crate::entanglement::{EntanglementReconciler, consumes_secret};
use crate::error::{KubeError, Result};
use crate::graph::KubeObjectGraph;

type Context = EntanglementReconciler<KubeObjectGraph>;

/// Watch link secrets and pods in the configured namespace and restart the
/// owners of pods whose links changed
///
/// Runs until the process receives a termination signal.
pub async fn run(client: Client, config: ReconcilerConfig) -> Result<()> {
    config.validate()?;

    let namespace = config.namespace.clone();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    info!(namespace = %namespace, "starting entanglement controller");

    let controller = Controller::new(pods, watcher::Config::default());
    let pod_store = controller.store();
    let context = Arc::new(EntanglementReconciler::new(KubeObjectGraph::new(client), config));

    controller
        .watches(secrets, watcher::Config::default(), move |secret: Secret| {
            let name = secret.name_any();
            let consumers: Vec<ObjectRef<Pod>> = pod_store
                .state()
                .into_iter()
                .filter(|pod| consumes_secret(pod, &namespace, &name))
                .map(|pod| ObjectRef::from_obj(pod.as_ref()))
                .collect();
            if !consumers.is_empty() {
                debug!(secret = %name, pods = consumers.len(), "link secret changed");
            }
            consumers
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => debug!(object = %object, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;

    info!("entanglement controller stopped");
    Ok(())
}

async fn reconcile(pod: Arc<Pod>, context: Arc<Context>) -> Result<Action> {
    if !has_entanglement(pod.annotations()) {
        return Ok(Action::await_change());
    }

    let namespace = pod.namespace().unwrap_or_default();
    let outcome = context.reconcile(&namespace, &pod.name_any()).await?;
    Ok(outcome.action())
}

fn error_policy(pod: Arc<Pod>, error: &KubeError, context: Arc<Context>) -> Action {
    let delay = context.config().meltdown_duration;
    warn!(name = %pod.name_any(), error = %error, requeue_after = ?delay, "requeueing pod");
    Action::requeue(delay)
}

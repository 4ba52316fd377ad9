//! End-to-end scenarios over the in-memory backends

use deckhand_kube::{ErrorKind, MemorySecretBackend, VersionedSecretStore};
use std::collections::BTreeMap;

fn store(backend: &MemorySecretBackend) -> VersionedSecretStore<MemorySecretBackend> {
    VersionedSecretStore::new(backend.clone(), "default")
}

async fn create(store: &VersionedSecretStore<MemorySecretBackend>, key: &str, payload: &str) -> u32 {
    store
        .create(key, payload.as_bytes().to_vec(), BTreeMap::new(), BTreeMap::new())
        .await
        .unwrap()
        .version
}

mod versioned_store {
    use super::*;

    #[tokio::test]
    async fn test_create_latest_delete() {
        let backend = MemorySecretBackend::new();
        let store = store(&backend);

        assert_eq!(create(&store, "depa", "payload1").await, 1);
        assert_eq!(create(&store, "depa", "payload2").await, 2);
        assert_eq!(store.latest("depa").await.unwrap().payload, b"payload2".to_vec());

        assert_eq!(store.delete_all("depa").await.unwrap(), 2);
        assert!(store.list_versions("depa").await.unwrap().is_empty());
        assert!(store.latest("depa").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_versions_are_dense_and_immutable() {
        let backend = MemorySecretBackend::new();
        let store = store(&backend);

        create(&store, "depa", "first").await;
        for i in 2..=5 {
            create(&store, "depa", &format!("payload{}", i)).await;
        }

        let versions: Vec<u32> = store
            .list_versions("depa")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.latest("depa").await.unwrap().version, 5);
        assert_eq!(store.get_version("depa", 1).await.unwrap().payload, b"first".to_vec());
    }

    #[tokio::test]
    async fn test_prefix_keys_do_not_mix() {
        let backend = MemorySecretBackend::new();
        let store = store(&backend);

        create(&store, "depa", "a").await;
        create(&store, "depa-1", "b").await;
        create(&store, "depa-1", "c").await;

        assert_eq!(store.list_versions("depa").await.unwrap().len(), 1);
        assert_eq!(store.list_versions("depa-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_names_leave_nothing_behind() {
        let backend = MemorySecretBackend::new();
        let store = store(&backend);

        let long = "a".repeat(260);
        for key in ["depA", "dep_a", long.as_str()] {
            let err = store
                .create(key, b"x".to_vec(), BTreeMap::new(), BTreeMap::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "key {}", key);
        }
        assert_eq!(backend.secret_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_get_distinct_versions() {
        let backend = MemorySecretBackend::new();
        let store = store(&backend);

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create("depa", format!("writer{}", i).into_bytes(), BTreeMap::new(), BTreeMap::new())
                        .await
                        .unwrap()
                        .version
                })
            })
            .collect();

        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap());
        }
        versions.sort();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }
}

mod manifests {
    use super::*;
    use deckhand_core::{Manifest, names};
    use deckhand_kube::{InstanceGroupResolver, ManifestPersister, PROPERTIES_KEY};

    const DESIRED: &str = "name: nats\ninstance_groups:\n- name: nats\n  instances: 2\n  jobs:\n  - name: nats\n    release: nats\n";

    #[tokio::test]
    async fn test_persist_then_resolve_instance_group() {
        let backend = MemorySecretBackend::new();
        let persister = ManifestPersister::new(backend.clone(), "default", "nats");
        let desired = Manifest::load_yaml(DESIRED.as_bytes()).unwrap();
        persister.persist_manifest(&desired, "bdpl default/nats").await.unwrap();

        // The interpolation step writes the resolved instance group
        VersionedSecretStore::new(backend.clone(), "default")
            .with_payload_field(PROPERTIES_KEY)
            .create(
                &names::instance_group_key("nats", "nats"),
                DESIRED.as_bytes().to_vec(),
                BTreeMap::new(),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        let resolved = InstanceGroupResolver::new(backend.clone(), "default")
            .resolve("nats", "nats")
            .await
            .unwrap();
        assert_eq!(resolved, desired);

        let mut secrets = backend.names("default");
        secrets.sort();
        assert_eq!(
            secrets,
            vec!["deployment-nats-1".to_string(), "nats.ig-resolved.nats-1".to_string()]
        );
    }
}

mod entanglement {
    use chrono::{TimeZone, Utc};
    use deckhand_core::{Clock, ManualClock, ReconcilerConfig};
    use deckhand_kube::annotations::entanglement;
    use deckhand_kube::{
        EntanglementReconciler, MemoryObjectGraph, OwnerEdge, ReconcileOutcome, Workload,
        WorkloadKind,
    };
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, ReplicaSet};
    use k8s_openapi::api::core::v1::{Pod, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn meta(name: &str, owner: Option<(&str, &str)>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("cf".to_string()),
            owner_references: owner.map(|(kind, name)| {
                vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: kind.to_string(),
                    name: name.to_string(),
                    uid: format!("uid-{}", name),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }
    }

    fn pod(name: &str, extra: BTreeMap<String, String>) -> Pod {
        let mut pod_meta = meta(name, Some(("ReplicaSet", "api-7d9")));
        let mut annotations = BTreeMap::from([
            (entanglement::DEPLOYMENT.to_string(), "nats".to_string()),
            (entanglement::CONSUMES.to_string(), r#"[{"name":"nats","type":"nats"}]"#.to_string()),
        ]);
        annotations.extend(extra);
        pod_meta.annotations = Some(annotations);
        Pod {
            metadata: pod_meta,
            ..Default::default()
        }
    }

    fn rotate_nats_link(graph: &MemoryObjectGraph) {
        graph.put_secret(Secret {
            metadata: meta("link-nats-nats", None),
            ..Default::default()
        });
    }

    fn setup() -> (MemoryObjectGraph, EntanglementReconciler<MemoryObjectGraph, ManualClock>, ManualClock) {
        let graph = MemoryObjectGraph::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

        graph.add_workload(Workload::ReplicaSet(ReplicaSet {
            metadata: meta("api-7d9", Some(("Deployment", "api"))),
            ..Default::default()
        }));
        graph.add_workload(Workload::Deployment(Deployment {
            metadata: meta("api", None),
            spec: Some(DeploymentSpec::default()),
            status: None,
        }));
        rotate_nats_link(&graph);

        let config = ReconcilerConfig {
            namespace: "cf".to_string(),
            meltdown_duration: Duration::from_secs(30),
            ..Default::default()
        };
        let reconciler = EntanglementReconciler::with_clock(graph.clone(), clock.clone(), config);
        (graph, reconciler, clock)
    }

    #[tokio::test]
    async fn test_burst_of_events_restarts_once() {
        let (graph, reconciler, clock) = setup();
        let start = clock.now();
        let stale = BTreeMap::from([(
            entanglement::LINKS_VERSION.to_string(),
            "link-nats-nats=0".to_string(),
        )]);
        graph.add_pod(pod("api-7d9-x", stale));

        let first = reconciler.reconcile("cf", "api-7d9-x").await.unwrap();
        assert_eq!(
            first,
            ReconcileOutcome::Restarted {
                touched: vec![OwnerEdge::new("Deployment", "api")],
                stamped: true,
            }
        );

        for elapsed in [1, 5, 29] {
            rotate_nats_link(&graph);
            clock.set(start + chrono::Duration::seconds(elapsed));
            let outcome = reconciler.reconcile("cf", "api-7d9-x").await.unwrap();
            assert_eq!(
                outcome,
                ReconcileOutcome::Meltdown {
                    requeue_after: Duration::from_secs(30 - elapsed as u64)
                }
            );
        }
        assert_eq!(graph.workload_updates(), vec![OwnerEdge::new("Deployment", "api")]);
    }

    #[tokio::test]
    async fn test_one_restart_per_link_change() {
        let (graph, reconciler, clock) = setup();
        graph.add_pod(pod("api-7d9-x", BTreeMap::new()));

        assert_eq!(reconciler.reconcile("cf", "api-7d9-x").await.unwrap(), ReconcileOutcome::Baseline);

        for round in 1..=3 {
            rotate_nats_link(&graph);
            clock.advance(chrono::Duration::seconds(31));
            let outcome = reconciler.reconcile("cf", "api-7d9-x").await.unwrap();
            assert!(matches!(outcome, ReconcileOutcome::Restarted { .. }), "round {}", round);

            // The rollout replaces the pod, the replacement comes from the template
            let template = graph
                .workload(WorkloadKind::Deployment, "cf", "api")
                .and_then(|w| w.template_annotations().cloned())
                .unwrap_or_default();
            graph.remove_pod("cf", "api-7d9-x");
            graph.add_pod(pod("api-7d9-x", template));

            clock.advance(chrono::Duration::seconds(31));
            let outcome = reconciler.reconcile("cf", "api-7d9-x").await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::UpToDate, "round {}", round);
            assert_eq!(graph.workload_updates().len(), round);
        }
    }
}

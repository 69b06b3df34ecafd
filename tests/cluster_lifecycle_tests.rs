//! Integration tests for cluster registration, inspection and removal
//!
//! The services run against the in-memory client, store and version service
//! from the `test-util` feature.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, Node, NodeSpec, NodeStatus, PersistentVolume, PersistentVolumeSpec,
    PersistentVolumeStatus, Pod, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use tokio_test::{assert_err, assert_ok};

use dbaas_controlplane::adapters::kubeconfig::MASK;
use dbaas_controlplane::adapters::ClusterType;
use dbaas_controlplane::crd::Engine;
use dbaas_controlplane::mock::{database_cluster, MockFailure, MockKubernetesClient};
use dbaas_controlplane::monitoring::{start_monitoring, ApiKey, CREDENTIALS_SECRET, VMAGENT_NAME};
use dbaas_controlplane::olm::{InstallRequest, OlmBootstrap, OperatorId, PollSettings, OPERATORS_NAMESPACE};
use dbaas_controlplane::services::{
    setup_monitoring, BootstrapPlan, ClusterStatus, KubernetesService, OperatorStatus, RegisterRequest,
};
use dbaas_controlplane::store::{ClusterRegistration, ClusterStore};
use dbaas_controlplane::Error;

use common::{test_config, Harness, KUBECONFIG};

// ============================================================================
// Test Helpers
// ============================================================================

const EKS_KUBECONFIG: &str = r#"apiVersion: v1
kind: Config
users:
- name: eks
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: aws-iam-authenticator
      args: ["token", "-i", "prod"]
      env:
      - name: AWS_ACCESS_KEY_ID
        value: AKIAEXAMPLE
      - name: AWS_SECRET_ACCESS_KEY
        value: s3cr3t
"#;

fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

fn node(name: &str, provider_id: Option<&str>, allocatable: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: provider_id.map(str::to_string),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            allocatable: Some(quantities(allocatable)),
            ..Default::default()
        }),
    }
}

fn pod(phase: &str, requests: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta::default(),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(quantities(requests)),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

fn volume(capacity: &str, phase: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta::default(),
        spec: Some(PersistentVolumeSpec {
            capacity: Some(quantities(&[("storage", capacity)])),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

// ============================================================================
// Registration Tests
// ============================================================================

#[tokio::test]
async fn test_register_bootstraps_empty_cluster() {
    let harness = Harness::new();
    harness.publish_platform();
    let client = harness.client();
    client.set_catalog_version(OperatorId::Pxc.package(), "1.11.0");
    client.set_catalog_version(OperatorId::Psmdb.package(), "1.12.0");

    let service = KubernetesService::new(harness.ctx.clone());
    assert_ok!(service.register_cluster(RegisterRequest::new("k8s", KUBECONFIG)).await);
    harness.ctx.launcher.wait_idle().await;

    let registration = harness.store.find_cluster("k8s").await.unwrap();
    assert!(registration.is_ready);
    assert!(client.has_object("VMAgent", VMAGENT_NAME));

    for operator in OperatorId::SUBSCRIBED {
        let plan = client
            .install_plan(OPERATORS_NAMESPACE, &format!("install-{}", operator.package()))
            .unwrap_or_else(|| panic!("no install plan for {}", operator));
        assert!(plan.spec.approved, "{} not approved", operator);
    }

    let created = harness.credentials.created();
    assert_eq!(created.len(), 1);
    assert!(created[0].starts_with("pmm-vmagent-k8s-"));
    assert!(harness.credentials.deleted().is_empty());

    let clusters = service.list_clusters().await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].status, ClusterStatus::Ok);
    let pxc = &clusters[0].operators[&OperatorId::Pxc];
    assert_eq!(pxc.status, OperatorStatus::Ok);
    assert_eq!(pxc.version.as_deref(), Some("1.11.0"));
    assert_eq!(clusters[0].operators[&OperatorId::Psmdb].status, OperatorStatus::Ok);
}

#[tokio::test]
async fn test_register_skips_installed_operators() {
    let harness = Harness::new();
    harness.publish_platform();
    let client = harness.client();
    client.add_olm();
    client.add_operator(OperatorId::Pxc, "1.10.0");

    let service = KubernetesService::new(harness.ctx.clone());
    service
        .register_cluster(RegisterRequest::new("k8s", KUBECONFIG))
        .await
        .unwrap();
    harness.ctx.launcher.wait_idle().await;

    assert!(client.subscription(OPERATORS_NAMESPACE, OperatorId::Pxc.package()).is_none());
    assert!(client.subscription(OPERATORS_NAMESPACE, OperatorId::Dbaas.package()).is_none());
    assert!(client.subscription(OPERATORS_NAMESPACE, OperatorId::Psmdb.package()).is_some());
    assert!(harness.store.find_cluster("k8s").await.unwrap().is_ready);
}

#[tokio::test]
async fn test_register_rejects_duplicates_before_connecting() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;

    let service = KubernetesService::new(harness.ctx.clone());
    let err = service
        .register_cluster(RegisterRequest::new("k8s", KUBECONFIG))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AlreadyExists(_)));
    assert_eq!(harness.factory.connections(), 0);
    assert!(harness.credentials.created().is_empty());
}

#[tokio::test]
async fn test_register_validates_request() {
    let harness = Harness::new();
    let service = KubernetesService::new(harness.ctx.clone());

    let err = service
        .register_cluster(RegisterRequest::new("  ", KUBECONFIG))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = service
        .register_cluster(RegisterRequest::new("k8s", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    assert!(harness.store.list_clusters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_register_requires_public_address() {
    let harness = Harness::with_config(dbaas_controlplane::config::Config {
        public_address: None,
        ..test_config()
    });
    harness.publish_platform();

    let service = KubernetesService::new(harness.ctx.clone());
    let err = service
        .register_cluster(RegisterRequest::new("k8s", KUBECONFIG))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PreconditionFailed(_)));
    assert!(harness.store.find_cluster("k8s").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_register_unreachable_cluster_stores_nothing() {
    let harness = Harness::new();
    harness.client().set_unreachable(true);

    let service = KubernetesService::new(harness.ctx.clone());
    assert_err!(service.register_cluster(RegisterRequest::new("k8s", KUBECONFIG)).await);
    assert!(harness.store.list_clusters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_register_after_shutdown_is_rejected() {
    let harness = Harness::new();
    harness.publish_platform();
    harness.client().add_olm();
    harness.ctx.launcher.shutdown().await;

    let service = KubernetesService::new(harness.ctx.clone());
    let err = service
        .register_cluster(RegisterRequest::new("k8s", KUBECONFIG))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}

#[tokio::test]
async fn test_register_injects_aws_keys() {
    let kubeconfig = r#"apiVersion: v1
kind: Config
users:
- name: eks
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: aws
      args: ["eks", "get-token", "--cluster-name", "prod"]
"#;
    let harness = Harness::new();
    let service = KubernetesService::new(harness.ctx.clone());

    service
        .register_cluster(RegisterRequest::new("eks", kubeconfig).with_aws_keys("AKIAEXAMPLE", "s3cr3t"))
        .await
        .unwrap();
    harness.ctx.launcher.wait_idle().await;

    let stored = harness.store.find_cluster("eks").await.unwrap().kubeconfig;
    assert!(stored.contains("aws-iam-authenticator"));
    assert!(stored.contains("AKIAEXAMPLE"));

    let details = service.get_cluster("eks").await.unwrap();
    assert!(!details.kubeconfig.contains("s3cr3t"));
    assert!(!details.kubeconfig.contains("AKIAEXAMPLE"));
}

// ============================================================================
// Bootstrap Failure Tests
// ============================================================================

/// Registration that has not finished its bootstrap yet
async fn pending_cluster(harness: &Harness) -> MockKubernetesClient {
    harness
        .store
        .create_cluster(ClusterRegistration::new("k8s", KUBECONFIG))
        .await
        .unwrap();
    harness.client()
}

fn full_plan() -> BootstrapPlan {
    BootstrapPlan {
        install_olm: true,
        operators: OperatorId::SUBSCRIBED.to_vec(),
    }
}

fn api_key() -> ApiKey {
    ApiKey {
        id: 7,
        key: "key-7".to_string(),
    }
}

#[tokio::test]
async fn test_operator_failure_does_not_stop_the_others() {
    let harness = Harness::new();
    let client = pending_cluster(&harness).await;
    client.fail_subscription(OperatorId::Psmdb.package());

    let errors = setup_monitoring(
        &harness.ctx,
        "k8s",
        Arc::new(client.clone()),
        &full_plan(),
        "pmm.example.com",
        api_key(),
    )
    .await;

    assert_eq!(errors.len(), 1);
    assert!(errors[&OperatorId::Psmdb].to_string().contains("no operators found"));

    for operator in [OperatorId::Pxc, OperatorId::Dbaas, OperatorId::VictoriaMetrics] {
        let plan = client
            .install_plan(OPERATORS_NAMESPACE, &format!("install-{}", operator.package()))
            .unwrap_or_else(|| panic!("no install plan for {}", operator));
        assert!(plan.spec.approved, "{} not approved", operator);
    }
    assert!(client.has_object("VMAgent", VMAGENT_NAME));
    assert!(harness.store.find_cluster("k8s").await.unwrap().is_ready);
}

#[tokio::test]
async fn test_olm_failure_leaves_cluster_not_ready() {
    let harness = Harness::new();
    let client = pending_cluster(&harness).await;
    client.fail_apply("CustomResourceDefinition");

    let errors = setup_monitoring(
        &harness.ctx,
        "k8s",
        Arc::new(client.clone()),
        &full_plan(),
        "pmm.example.com",
        api_key(),
    )
    .await;

    assert_eq!(errors.keys().collect::<Vec<_>>(), vec![&OperatorId::Olm]);
    assert!(errors[&OperatorId::Olm].to_string().contains("crds bundle"));
    assert!(client.subscription(OPERATORS_NAMESPACE, OperatorId::Pxc.package()).is_none());
    assert!(!client.has_object("VMAgent", VMAGENT_NAME));
    assert!(!harness.store.find_cluster("k8s").await.unwrap().is_ready);
}

#[tokio::test]
async fn test_vm_operator_failure_skips_monitoring() {
    let harness = Harness::new();
    let client = pending_cluster(&harness).await;
    client.add_olm();
    client.fail_subscription(OperatorId::VictoriaMetrics.package());

    let plan = BootstrapPlan {
        install_olm: false,
        operators: vec![OperatorId::Dbaas, OperatorId::VictoriaMetrics],
    };
    let errors = setup_monitoring(
        &harness.ctx,
        "k8s",
        Arc::new(client.clone()),
        &plan,
        "pmm.example.com",
        api_key(),
    )
    .await;

    assert_eq!(errors.keys().collect::<Vec<_>>(), vec![&OperatorId::VictoriaMetrics]);
    assert!(client.subscription(OPERATORS_NAMESPACE, OperatorId::Dbaas.package()).is_some());
    assert!(!client.has_object("VMAgent", VMAGENT_NAME));
    assert!(!harness.store.find_cluster("k8s").await.unwrap().is_ready);
}

#[tokio::test]
async fn test_missing_install_plan_times_out() {
    let client = MockKubernetesClient::new();
    client.withhold_install_plan(OperatorId::Pxc.package());

    let bootstrap = OlmBootstrap::with_poll(
        Arc::new(client.clone()),
        PollSettings {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(50),
        },
    );
    let err = bootstrap
        .install_operator(&InstallRequest::for_operator(OperatorId::Pxc, "stable-v1"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)), "unexpected error: {}", err);
    assert!(client.subscription(OPERATORS_NAMESPACE, OperatorId::Pxc.package()).is_some());
}

// ============================================================================
// Unregistration Tests
// ============================================================================

async fn cluster_with_database(harness: &Harness) -> MockKubernetesClient {
    harness.add_cluster("k8s", KUBECONFIG).await;
    let client = harness.client();
    client.add_database_cluster(database_cluster("default", "mysql-1", Engine::Pxc, "percona/pxc:8.0.27"));
    client
}

#[tokio::test]
async fn test_unregister_with_databases_needs_force() {
    let harness = Harness::new();
    cluster_with_database(&harness).await;
    let service = KubernetesService::new(harness.ctx.clone());

    let err = service.unregister_cluster("k8s", false).await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
    assert!(harness.store.find_cluster("k8s").await.is_ok());

    assert_ok!(service.unregister_cluster("k8s", true).await);
    assert!(harness.store.find_cluster("k8s").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_unregister_without_database_resource() {
    let harness = Harness::new();
    let client = cluster_with_database(&harness).await;
    client.fail_database_cluster_list(Some(MockFailure::AccessDenied));

    let service = KubernetesService::new(harness.ctx.clone());
    assert_ok!(service.unregister_cluster("k8s", false).await);
    assert!(harness.store.list_clusters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unregister_propagates_listing_errors() {
    let harness = Harness::new();
    let client = cluster_with_database(&harness).await;
    client.fail_database_cluster_list(Some(MockFailure::Unavailable));

    let service = KubernetesService::new(harness.ctx.clone());
    assert_err!(service.unregister_cluster("k8s", false).await);
    assert!(harness.store.find_cluster("k8s").await.is_ok());
}

#[tokio::test]
async fn test_unregister_unknown_cluster() {
    let harness = Harness::new();
    let service = KubernetesService::new(harness.ctx.clone());

    let err = service.unregister_cluster("missing", true).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_rejected_unregister_keeps_monitoring() {
    let harness = Harness::new();
    let client = cluster_with_database(&harness).await;
    assert_ok!(start_monitoring(&client, "pmm.example.com", "key-1").await);

    let service = KubernetesService::new(harness.ctx.clone());
    let err = service.unregister_cluster("k8s", false).await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));

    assert!(client.has_object("VMAgent", VMAGENT_NAME));
    assert!(client.has_object("Secret", CREDENTIALS_SECRET));
    // the cached client is still served
    assert_ok!(harness.ctx.client("k8s").await);
    assert_eq!(harness.factory.connections(), 1);

    assert_ok!(service.unregister_cluster("k8s", true).await);
    assert!(!client.has_object("VMAgent", VMAGENT_NAME));
    assert!(!client.has_object("Secret", CREDENTIALS_SECRET));
}

#[tokio::test]
async fn test_forced_unregister_without_client() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    harness.factory.refuse(KUBECONFIG);
    let service = KubernetesService::new(harness.ctx.clone());

    let err = service.unregister_cluster("k8s", false).await.unwrap_err();
    assert!(err.to_string().contains("exec plugin"));
    assert!(harness.store.find_cluster("k8s").await.is_ok());

    assert_ok!(service.unregister_cluster("k8s", true).await);
    assert!(harness.store.find_cluster("k8s").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_forced_unregister_of_unreachable_cluster() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    harness.client().set_unreachable(true);
    let service = KubernetesService::new(harness.ctx.clone());

    assert_ok!(service.unregister_cluster("k8s", true).await);
    assert!(harness.store.list_clusters().await.unwrap().is_empty());
}

// ============================================================================
// Inspection Tests
// ============================================================================

#[tokio::test]
async fn test_list_reports_unavailable_clusters() {
    let harness = Harness::new();
    harness.publish_platform();
    harness.add_cluster("up", KUBECONFIG).await;
    harness.add_cluster("down", "apiVersion: v1\nkind: Config\nclusters: []\n").await;
    harness.client().add_operator(OperatorId::Psmdb, "1.9.0");
    harness
        .factory
        .client("apiVersion: v1\nkind: Config\nclusters: []\n")
        .set_unreachable(true);

    let service = KubernetesService::new(harness.ctx.clone());
    let clusters = service.list_clusters().await.unwrap();
    let by_name: BTreeMap<_, _> = clusters.iter().map(|c| (c.name.as_str(), c)).collect();

    let down = by_name["down"];
    assert_eq!(down.status, ClusterStatus::Unavailable);
    assert!(down.operators.is_empty());

    let up = by_name["up"];
    assert_eq!(up.status, ClusterStatus::Ok);
    assert_eq!(up.operators[&OperatorId::Pxc].status, OperatorStatus::NotInstalled);
    assert_eq!(up.operators[&OperatorId::Psmdb].status, OperatorStatus::Unsupported);
}

#[tokio::test]
async fn test_list_allows_unsupported_operators_when_configured() {
    let harness = Harness::with_config(dbaas_controlplane::config::Config {
        allow_unsupported_operators: true,
        ..test_config()
    });
    harness.publish_platform();
    harness.add_cluster("k8s", KUBECONFIG).await;
    harness.client().add_operator(OperatorId::Psmdb, "1.9.0");

    let service = KubernetesService::new(harness.ctx.clone());
    let clusters = service.list_clusters().await.unwrap();
    assert_eq!(clusters[0].operators[&OperatorId::Psmdb].status, OperatorStatus::Ok);
}

#[tokio::test]
async fn test_get_cluster_masks_credentials() {
    let harness = Harness::new();
    harness.add_cluster("eks", EKS_KUBECONFIG).await;

    let service = KubernetesService::new(harness.ctx.clone());
    let details = service.get_cluster("eks").await.unwrap();

    assert_eq!(details.name, "eks");
    assert!(details.is_ready);
    assert!(!details.kubeconfig.contains("s3cr3t"));
    assert!(details.kubeconfig.contains("aws-iam-authenticator"));
}

#[tokio::test]
async fn test_get_cluster_masks_bearer_token() {
    let harness = Harness::new();
    let kubeconfig = "apiVersion: v1\nkind: Config\nusers:\n- name: admin\n  user:\n    token: SUPERSECRETTOKEN\n";
    harness.add_cluster("k8s", kubeconfig).await;

    let service = KubernetesService::new(harness.ctx.clone());
    let details = service.get_cluster("k8s").await.unwrap();

    assert!(!details.kubeconfig.contains("SUPERSECRETTOKEN"));
    assert!(details.kubeconfig.contains(MASK));
    // the stored registration keeps the real token
    let stored = harness.store.find_cluster("k8s").await.unwrap();
    assert!(stored.kubeconfig.contains("SUPERSECRETTOKEN"));
}

#[tokio::test]
async fn test_resources_of_generic_cluster() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    let client = harness.client();
    client.add_node(node("node-1", None, &[("cpu", "4"), ("memory", "8Gi"), ("ephemeral-storage", "100Gi")]));
    client.add_node(node("node-2", None, &[("cpu", "2"), ("memory", "4Gi"), ("ephemeral-storage", "50Gi")]));
    client.add_pod(pod("Running", &[("cpu", "500m"), ("memory", "1Gi")]));
    client.add_pod(pod("Succeeded", &[("cpu", "2"), ("memory", "2Gi")]));

    let service = KubernetesService::new(harness.ctx.clone());
    let resources = service.get_resources("k8s").await.unwrap();

    const GI: u64 = 1 << 30;
    assert_eq!(resources.cluster_type, ClusterType::Generic);
    assert_eq!(resources.all.cpu_millis, 6000);
    assert_eq!(resources.all.memory_bytes, 12 * GI);
    assert_eq!(resources.all.disk_bytes, 150 * GI);
    assert_eq!(resources.available.cpu_millis, 5500);
    assert_eq!(resources.available.memory_bytes, 11 * GI);
    assert_eq!(resources.available.disk_bytes, 150 * GI);
}

#[tokio::test]
async fn test_resources_of_eks_cluster_count_volumes() {
    let harness = Harness::new();
    harness.add_cluster("eks", KUBECONFIG).await;
    let client = harness.client();
    client.add_node(node(
        "ip-10-0-0-1",
        Some("aws:///eu-west-1a/i-0123"),
        &[("cpu", "2"), ("memory", "4Gi"), ("ephemeral-storage", "20Gi")],
    ));
    client.add_persistent_volume(volume("10Gi", "Bound"));
    client.add_persistent_volume(volume("5Gi", "Available"));

    let service = KubernetesService::new(harness.ctx.clone());
    let resources = service.get_resources("eks").await.unwrap();

    const GI: u64 = 1 << 30;
    assert_eq!(resources.cluster_type, ClusterType::Eks);
    assert_eq!(resources.all.disk_bytes, 15 * GI);
    assert_eq!(resources.available.disk_bytes, 5 * GI);
}

#[tokio::test]
async fn test_list_storage_classes() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    let client = harness.client();
    client.add_storage_class("standard");
    client.add_storage_class("gp2");

    let service = KubernetesService::new(harness.ctx.clone());
    assert_eq!(
        service.list_storage_classes("k8s").await.unwrap(),
        vec!["standard".to_string(), "gp2".to_string()]
    );
}

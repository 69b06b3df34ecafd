//! Integration tests for component catalogues and operator upgrades

mod common;

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use tokio_test::assert_ok;

use dbaas_controlplane::adapters::KubernetesClient;
use dbaas_controlplane::crd::{Engine, Subscription, SubscriptionSpec, SubscriptionStatus};
use dbaas_controlplane::olm::{OperatorId, OPERATORS_NAMESPACE};
use dbaas_controlplane::services::{ComponentsService, OperatorStatus};
use dbaas_controlplane::store::ClusterStore;
use dbaas_controlplane::version::{ChangeComponent, Matrix, MatrixParams, VersionEntry, VersionToggle};
use dbaas_controlplane::Error;

use common::{component, Harness, KUBECONFIG};

// ============================================================================
// Test Helpers
// ============================================================================

fn pxc_entry(operator_version: &str) -> VersionEntry {
    let mut matrix = Matrix::default();
    matrix.pxc.insert("5.7.36-31.55".into(), component("available", "percona/pxc:5.7.36"));
    matrix.pxc.insert("8.0.19-10.1".into(), component("available", "percona/pxc:8.0.19"));
    matrix.pxc.insert("8.0.25-15.1".into(), component("recommended", "percona/pxc:8.0.25"));
    matrix.pxc.insert("8.0.27-18.1".into(), component("recommended", "percona/pxc:8.0.27"));
    matrix.haproxy.insert("2.5.6".into(), component("recommended", "percona/haproxy:2.5.6"));
    matrix.pmm.insert("2.30.0".into(), component("recommended", "percona/pmm-client:2.30.0"));

    VersionEntry {
        product: "pxc-operator".to_string(),
        product_version: operator_version.to_string(),
        matrix,
    }
}

fn toggle(version: &str, enable: bool, disable: bool) -> VersionToggle {
    VersionToggle {
        version: version.to_string(),
        enable,
        disable,
    }
}

fn change(default: Option<&str>, versions: Vec<VersionToggle>) -> ChangeComponent {
    ChangeComponent {
        default_version: default.map(str::to_string),
        versions,
    }
}

fn subscription(operator: OperatorId, current: &str, installed: &str) -> Subscription {
    Subscription {
        metadata: ObjectMeta {
            name: Some(operator.package().to_string()),
            namespace: Some(OPERATORS_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: SubscriptionSpec {
            name: operator.package().to_string(),
            ..Default::default()
        },
        status: Some(SubscriptionStatus {
            current_csv: Some(format!("{}.v{}", operator.package(), current)),
            installed_csv: Some(format!("{}.v{}", operator.package(), installed)),
            ..Default::default()
        }),
    }
}

// ============================================================================
// Catalogue Tests
// ============================================================================

#[tokio::test]
async fn test_components_without_cluster() {
    let harness = Harness::new();
    harness.versions.add(MatrixParams::new("pxc-operator"), vec![pxc_entry("1.11.0")]);

    let service = ComponentsService::new(harness.ctx.clone());
    let result = service.get_components(Engine::Pxc, None, None).await.unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(result[0].operator_version, "1.11.0");

    let pxc = &result[0].matrix["pxc"];
    assert!(!pxc.contains_key("5.7.36-31.55"));
    assert_eq!(pxc.len(), 3);
    assert!(pxc["8.0.27-18.1"].default);
    assert!(!pxc["8.0.25-15.1"].default);

    assert!(result[0].matrix["haproxy"]["2.5.6"].default);
    assert!(result[0].matrix["pmm"]["2.30.0"].default);
    assert!(result[0].matrix["mongod"].is_empty());
}

#[tokio::test]
async fn test_components_apply_cluster_overrides() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    harness.client().add_operator(OperatorId::Pxc, "1.11.0");
    harness.versions.add(
        MatrixParams::new("pxc-operator").with_product_version("1.11.0"),
        vec![pxc_entry("1.11.0")],
    );

    let service = ComponentsService::new(harness.ctx.clone());
    let mut changes = BTreeMap::new();
    changes.insert(
        "pxc".to_string(),
        change(Some("8.0.25-15.1"), vec![toggle("8.0.27-18.1", false, true)]),
    );
    assert_ok!(service.change_components("k8s", changes).await);

    let result = service.get_components(Engine::Pxc, Some("k8s"), None).await.unwrap();
    let pxc = &result[0].matrix["pxc"];
    assert!(pxc["8.0.25-15.1"].default);
    assert!(pxc["8.0.27-18.1"].disabled);
    assert!(!pxc["8.0.27-18.1"].default);
}

#[tokio::test]
async fn test_disabled_recommended_version_is_not_default() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    harness.client().add_operator(OperatorId::Pxc, "1.11.0");
    harness.versions.add(
        MatrixParams::new("pxc-operator").with_product_version("1.11.0"),
        vec![pxc_entry("1.11.0")],
    );

    let service = ComponentsService::new(harness.ctx.clone());
    let mut changes = BTreeMap::new();
    changes.insert("pxc".to_string(), change(None, vec![toggle("8.0.27-18.1", false, true)]));
    service.change_components("k8s", changes).await.unwrap();

    let result = service.get_components(Engine::Pxc, Some("k8s"), None).await.unwrap();
    let pxc = &result[0].matrix["pxc"];
    assert!(pxc["8.0.25-15.1"].default);
    assert_eq!(pxc.values().filter(|c| c.default).count(), 1);
}

#[tokio::test]
async fn test_components_of_unknown_cluster() {
    let harness = Harness::new();
    let service = ComponentsService::new(harness.ctx.clone());

    let err = service
        .get_components(Engine::Psmdb, Some("missing"), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

// ============================================================================
// Override Tests
// ============================================================================

#[tokio::test]
async fn test_change_rejects_enable_and_disable_together() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    let service = ComponentsService::new(harness.ctx.clone());

    let mut changes = BTreeMap::new();
    changes.insert("haproxy".to_string(), change(Some("2.5.6"), Vec::new()));
    changes.insert("pxc".to_string(), change(None, vec![toggle("8.0.19-10.1", true, true)]));

    let err = service.change_components("k8s", changes).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(err.to_string().contains("component: pxc"));

    // nothing from the batch was stored
    let registration = harness.store.find_cluster("k8s").await.unwrap();
    assert!(registration.components.is_empty());
}

#[tokio::test]
async fn test_change_rejects_disabling_default() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    let service = ComponentsService::new(harness.ctx.clone());

    let mut changes = BTreeMap::new();
    changes.insert("mongod".to_string(), change(Some("4.4.10-11"), Vec::new()));
    service.change_components("k8s", changes).await.unwrap();

    let mut changes = BTreeMap::new();
    changes.insert("mongod".to_string(), change(None, vec![toggle("4.4.10-11", false, true)]));
    let err = service.change_components("k8s", changes).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let registration = harness.store.find_cluster("k8s").await.unwrap();
    assert_eq!(registration.default_version("mongod"), Some("4.4.10-11"));
    assert!(registration.components["mongod"].disabled_versions.is_empty());
}

#[tokio::test]
async fn test_change_rejects_fixed_components() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    let service = ComponentsService::new(harness.ctx.clone());

    let mut changes = BTreeMap::new();
    changes.insert("pmm".to_string(), change(Some("2.30.0"), Vec::new()));
    let err = service.change_components("k8s", changes).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_change_unknown_cluster() {
    let harness = Harness::new();
    let service = ComponentsService::new(harness.ctx.clone());

    let mut changes = BTreeMap::new();
    changes.insert("pxc".to_string(), change(Some("8.0.27-18.1"), Vec::new()));
    let err = service.change_components("missing", changes).await.unwrap_err();
    assert!(err.is_not_found());
}

// ============================================================================
// Operator Upgrade Tests
// ============================================================================

#[tokio::test]
async fn test_check_for_operator_update() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    harness.add_cluster("broken", "apiVersion: v1\nkind: Config\nclusters: []\n").await;

    let client = harness.client();
    client.add_subscription(subscription(OperatorId::Pxc, "1.12.0", "1.11.0"));
    client.add_subscription(subscription(OperatorId::Psmdb, "1.12.0", "1.12.0"));
    client.add_subscription(subscription(OperatorId::VictoriaMetrics, "0.25.0", "0.24.0"));
    harness
        .factory
        .client("apiVersion: v1\nkind: Config\nclusters: []\n")
        .fail_subscription_list(true);

    let service = ComponentsService::new(harness.ctx.clone());
    let updates = service.check_for_operator_update().await.unwrap();

    assert!(!updates.contains_key("broken"));
    let k8s = &updates["k8s"];
    assert_eq!(k8s.len(), 1);
    assert_eq!(k8s[&OperatorId::Pxc], "1.12.0");
}

async fn pending_pxc_upgrade(harness: &Harness) {
    let client = harness.client();
    client.add_operator(OperatorId::Pxc, "1.11.0");
    client.set_catalog_version(OperatorId::Pxc.package(), "1.12.0");

    let mut pending = subscription(OperatorId::Pxc, "1.12.0", "1.11.0");
    pending.status = None;
    client.create_subscription(OPERATORS_NAMESPACE, &pending).await.unwrap();
}

#[tokio::test]
async fn test_install_operator_approves_pending_plan_once() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    pending_pxc_upgrade(&harness).await;

    let service = ComponentsService::new(harness.ctx.clone());
    let status = service.install_operator("k8s", OperatorId::Pxc, "1.12.0").await.unwrap();
    assert_eq!(status, OperatorStatus::Ok);

    let client = harness.client();
    let plan = client
        .install_plan(OPERATORS_NAMESPACE, &format!("install-{}", OperatorId::Pxc.package()))
        .unwrap();
    assert!(plan.spec.approved);
    assert_eq!(client.plan_updates(), 1);

    // already approved: nothing to update
    let status = service.install_operator("k8s", OperatorId::Pxc, "1.12.0").await.unwrap();
    assert_eq!(status, OperatorStatus::Ok);
    assert_eq!(client.plan_updates(), 1);
}

#[tokio::test]
async fn test_install_operator_checks_default_database_version() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    pending_pxc_upgrade(&harness).await;

    let service = ComponentsService::new(harness.ctx.clone());
    let mut changes = BTreeMap::new();
    changes.insert("pxc".to_string(), change(Some("8.0.19-10.1"), Vec::new()));
    service.change_components("k8s", changes).await.unwrap();

    // 1.12.0 does not publish 8.0.19-10.1
    let err = service
        .install_operator("k8s", OperatorId::Pxc, "1.12.0")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
    assert_eq!(harness.client().plan_updates(), 0);

    harness.versions.add(
        MatrixParams::new("pxc-operator")
            .with_product_version("1.12.0")
            .with_db_version("8.0.19-10.1"),
        vec![pxc_entry("1.12.0")],
    );
    assert_ok!(service.install_operator("k8s", OperatorId::Pxc, "1.12.0").await);
    assert_eq!(harness.client().plan_updates(), 1);
}

#[tokio::test]
async fn test_install_operator_rejects_platform_operators() {
    let harness = Harness::new();
    harness.add_cluster("k8s", KUBECONFIG).await;
    let service = ComponentsService::new(harness.ctx.clone());

    let err = service
        .install_operator("k8s", OperatorId::VictoriaMetrics, "0.25.0")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

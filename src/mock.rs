//! In-memory collaborators for tests
//!
//! [`MockKubernetesClient`] behaves like a small cluster where OLM reacts
//! instantly: applied deployments are rolled out, subscriptions get an
//! install plan right away and approving a plan starts the operator. Each of
//! those steps can be made to fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{Container, Node, PersistentVolume, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ObjectMeta;

use crate::adapters::{ClientFactory, KubernetesClient, Manifest};
use crate::crd::{
    AppState, ClusterServiceVersion, ClusterServiceVersionSpec, ClusterServiceVersionStatus,
    DatabaseCluster, DatabaseClusterSpec, DatabaseClusterStatus, Engine, InstallPlan,
    InstallPlanReference, InstallPlanSpec, OperatorGroup, Subscription, SubscriptionStatus,
};
use crate::error::{Error, Result};
use crate::monitoring::{ApiKey, MonitoringCredentials};
use crate::olm::OPERATORS_NAMESPACE;
use crate::version::{MatrixParams, VersionEntry, VersionResolver, VersionResponse};

type Key = (String, String);

fn key(a: &str, b: &str) -> Key {
    (a.to_string(), b.to_string())
}

/// Failure injected into database cluster calls
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockFailure {
    /// The DatabaseCluster resource type is not served
    AccessDenied,
    /// Any other API failure
    Unavailable,
}

impl MockFailure {
    fn error(self) -> Error {
        match self {
            MockFailure::AccessDenied => Error::AccessDenied(
                "the server doesn't have a resource type \"DatabaseCluster\"".to_string(),
            ),
            MockFailure::Unavailable => Error::internal("connection refused"),
        }
    }
}

#[derive(Default)]
struct MockState {
    server_version: String,
    unreachable: bool,
    deployments: HashMap<Key, Deployment>,
    objects: HashMap<Key, serde_json::Value>,
    database_clusters: BTreeMap<Key, DatabaseCluster>,
    list_failure: Option<MockFailure>,
    get_failure: Option<MockFailure>,
    storage_classes: Vec<StorageClass>,
    nodes: Vec<Node>,
    pods: Vec<Pod>,
    volumes: Vec<PersistentVolume>,
    operator_groups: HashMap<Key, OperatorGroup>,
    subscriptions: HashMap<Key, Subscription>,
    subscription_list_fails: bool,
    install_plans: HashMap<Key, InstallPlan>,
    csvs: HashMap<Key, ClusterServiceVersion>,
    catalog_versions: HashMap<String, String>,
    /// Manifest kinds whose apply fails
    apply_failures: HashSet<String>,
    /// Packages whose subscription can not be created
    subscription_failures: HashSet<String>,
    /// Packages OLM never plans an install for
    withheld_plans: HashSet<String>,
}

/// In-memory [`KubernetesClient`]
#[derive(Clone)]
pub struct MockKubernetesClient {
    state: Arc<Mutex<MockState>>,
    list_calls: Arc<AtomicUsize>,
    plan_updates: Arc<AtomicUsize>,
}

impl Default for MockKubernetesClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKubernetesClient {
    /// Reachable cluster without OLM or operators
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                server_version: "v1.24.3".to_string(),
                ..Default::default()
            })),
            list_calls: Arc::new(AtomicUsize::new(0)),
            plan_updates: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every connection probe fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Pretend OLM is running
    pub fn add_olm(&self) {
        self.add_deployment(crate::olm::OLM_NAMESPACE, "olm-operator", "quay.io/operator-framework/olm:v0.22.0");
    }

    /// Pretend an operator is running at `version`
    pub fn add_operator(&self, operator: crate::olm::OperatorId, version: &str) {
        let image = format!("percona/{}:{}", operator.package(), version);
        self.add_deployment(OPERATORS_NAMESPACE, operator.package(), &image);
    }

    /// Version OLM installs for a package, `1.0.0` by default
    pub fn set_catalog_version(&self, package: &str, version: &str) {
        self.state
            .lock()
            .unwrap()
            .catalog_versions
            .insert(package.to_string(), version.to_string());
    }

    pub fn add_deployment(&self, namespace: &str, name: &str, image: &str) {
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert(key(namespace, name), rolled_out_deployment(namespace, name, image));
    }

    pub fn add_database_cluster(&self, cluster: DatabaseCluster) {
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .database_clusters
            .insert((namespace, name), cluster);
    }

    pub fn remove_database_cluster(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .database_clusters
            .remove(&key(namespace, name));
    }

    pub fn set_database_cluster_state(&self, namespace: &str, name: &str, state: AppState) {
        if let Some(cluster) = self
            .state
            .lock()
            .unwrap()
            .database_clusters
            .get_mut(&key(namespace, name))
        {
            cluster.status.get_or_insert_with(Default::default).state = Some(state);
        }
    }

    pub fn fail_database_cluster_list(&self, failure: Option<MockFailure>) {
        self.state.lock().unwrap().list_failure = failure;
    }

    pub fn fail_database_cluster_get(&self, failure: Option<MockFailure>) {
        self.state.lock().unwrap().get_failure = failure;
    }

    pub fn add_storage_class(&self, name: &str) {
        self.state.lock().unwrap().storage_classes.push(StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: "kubernetes.io/no-provisioner".to_string(),
            ..Default::default()
        });
    }

    pub fn add_node(&self, node: Node) {
        self.state.lock().unwrap().nodes.push(node);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state.lock().unwrap().pods.push(pod);
    }

    pub fn add_persistent_volume(&self, volume: PersistentVolume) {
        self.state.lock().unwrap().volumes.push(volume);
    }

    pub fn add_subscription(&self, subscription: Subscription) {
        let namespace = subscription.metadata.namespace.clone().unwrap_or_default();
        let name = subscription.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .insert((namespace, name), subscription);
    }

    pub fn fail_subscription_list(&self, fail: bool) {
        self.state.lock().unwrap().subscription_list_fails = fail;
    }

    /// Reject applies of manifests of `kind`
    pub fn fail_apply(&self, kind: &str) {
        self.state.lock().unwrap().apply_failures.insert(kind.to_string());
    }

    /// Reject subscriptions to `package`
    pub fn fail_subscription(&self, package: &str) {
        self.state
            .lock()
            .unwrap()
            .subscription_failures
            .insert(package.to_string());
    }

    /// Accept subscriptions to `package` without ever creating an install plan
    pub fn withhold_install_plan(&self, package: &str) {
        self.state
            .lock()
            .unwrap()
            .withheld_plans
            .insert(package.to_string());
    }

    /// True when an applied manifest of that kind and name is present
    pub fn has_object(&self, kind: &str, name: &str) -> bool {
        self.state.lock().unwrap().objects.contains_key(&key(kind, name))
    }

    pub fn install_plan(&self, namespace: &str, name: &str) -> Option<InstallPlan> {
        self.state
            .lock()
            .unwrap()
            .install_plans
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn subscription(&self, namespace: &str, name: &str) -> Option<Subscription> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get(&key(namespace, name))
            .cloned()
    }

    /// Number of `list_database_clusters` calls
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of install plan updates
    pub fn plan_updates(&self) -> usize {
        self.plan_updates.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.state.lock().unwrap().unreachable {
            return Err(Error::internal("dial tcp 10.0.0.1:6443: connect: connection refused"));
        }
        Ok(())
    }
}

/// Deployment whose rollout already finished
pub fn rolled_out_deployment(namespace: &str, name: &str, image: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            observed_generation: Some(1),
            replicas: Some(1),
            updated_replicas: Some(1),
            available_replicas: Some(1),
            ready_replicas: Some(1),
            ..Default::default()
        }),
    }
}

/// Database cluster object as the dbaas operator would report it
pub fn database_cluster(namespace: &str, name: &str, engine: Engine, image: &str) -> DatabaseCluster {
    let mut cluster = DatabaseCluster::new(
        name,
        DatabaseClusterSpec {
            database: engine,
            database_image: image.to_string(),
            database_config: None,
            cluster_size: 3,
            pause: false,
        },
    );
    cluster.metadata.namespace = Some(namespace.to_string());
    cluster.status = Some(DatabaseClusterStatus {
        state: Some(AppState::Ready),
        ..Default::default()
    });
    cluster
}

#[async_trait::async_trait]
impl KubernetesClient for MockKubernetesClient {
    async fn server_version(&self) -> Result<String> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().server_version.clone())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .deployments
            .get(&key(namespace, name))
            .cloned())
    }

    async fn list_database_clusters(&self) -> Result<Vec<DatabaseCluster>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        if let Some(failure) = state.list_failure {
            return Err(failure.error());
        }
        Ok(state.database_clusters.values().cloned().collect())
    }

    async fn get_database_cluster(&self, namespace: &str, name: &str) -> Result<DatabaseCluster> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        if let Some(failure) = state.get_failure {
            return Err(failure.error());
        }
        state
            .database_clusters
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("databaseclusters {:?} not found", name)))
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().storage_classes.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().pods.clone())
    }

    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().volumes.clone())
    }

    async fn apply(&self, manifest: &Manifest) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        if state.apply_failures.contains(manifest.kind()) {
            return Err(Error::internal(format!(
                "admission webhook denied {} {}",
                manifest.kind(),
                manifest.name
            )));
        }
        let namespace = manifest.namespace.as_deref().unwrap_or("default");

        match manifest.kind() {
            "Deployment" => {
                let image = manifest
                    .value
                    .pointer("/spec/template/spec/containers/0/image")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                state.deployments.insert(
                    key(namespace, &manifest.name),
                    rolled_out_deployment(namespace, &manifest.name, image),
                );
            }
            "ClusterServiceVersion" => {
                // OLM turns the CSV into a deployment of the same name
                state.deployments.insert(
                    key(namespace, &manifest.name),
                    rolled_out_deployment(namespace, &manifest.name, ""),
                );
                state.csvs.insert(
                    key(namespace, &manifest.name),
                    succeeded_csv(namespace, &manifest.name),
                );
            }
            _ => {}
        }
        state
            .objects
            .insert(key(manifest.kind(), &manifest.name), manifest.value.clone());
        Ok(())
    }

    async fn delete(&self, manifest: &Manifest) -> Result<()> {
        self.check_reachable()?;
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&key(manifest.kind(), &manifest.name));
        Ok(())
    }

    async fn get_operator_group(&self, namespace: &str, name: &str) -> Result<Option<OperatorGroup>> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .operator_groups
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_operator_group(&self, namespace: &str, group: &OperatorGroup) -> Result<()> {
        self.check_reachable()?;
        let name = group.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .operator_groups
            .insert(key(namespace, &name), group.clone());
        Ok(())
    }

    async fn get_subscription(&self, namespace: &str, name: &str) -> Result<Option<Subscription>> {
        self.check_reachable()?;
        Ok(self.subscription(namespace, name))
    }

    async fn create_subscription(&self, namespace: &str, subscription: &Subscription) -> Result<()> {
        self.check_reachable()?;
        let name = subscription.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if state.subscriptions.contains_key(&key(namespace, &name)) {
            return Ok(());
        }
        if state.subscription_failures.contains(&subscription.spec.name) {
            return Err(Error::internal(format!(
                "constraints not satisfiable: no operators found in package {}",
                subscription.spec.name
            )));
        }
        if state.withheld_plans.contains(&subscription.spec.name) {
            state
                .subscriptions
                .insert(key(namespace, &name), subscription.clone());
            return Ok(());
        }

        let version = state
            .catalog_versions
            .get(&subscription.spec.name)
            .cloned()
            .unwrap_or_else(|| "1.0.0".to_string());
        let csv = format!("{}.v{}", subscription.spec.name, version);
        let plan_name = format!("install-{}", name);

        state.install_plans.insert(
            key(namespace, &plan_name),
            InstallPlan {
                metadata: ObjectMeta {
                    name: Some(plan_name.clone()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: InstallPlanSpec {
                    cluster_service_version_names: vec![csv.clone()],
                    approval: subscription.spec.install_plan_approval.unwrap_or_default(),
                    approved: false,
                    generation: Some(1),
                },
                status: None,
            },
        );

        let mut created = subscription.clone();
        created.status = Some(SubscriptionStatus {
            install_plan: Some(InstallPlanReference {
                api_version: Some("operators.coreos.com/v1alpha1".to_string()),
                kind: Some("InstallPlan".to_string()),
                name: plan_name,
                uuid: None,
            }),
            current_csv: Some(csv),
            installed_csv: None,
            state: Some("UpgradePending".to_string()),
        });
        state.subscriptions.insert(key(namespace, &name), created);
        Ok(())
    }

    async fn list_subscriptions(&self, namespace: &str) -> Result<Vec<Subscription>> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        if state.subscription_list_fails {
            return Err(Error::internal("cannot list subscriptions"));
        }
        Ok(state
            .subscriptions
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn get_install_plan(&self, namespace: &str, name: &str) -> Result<InstallPlan> {
        self.check_reachable()?;
        self.install_plan(namespace, name)
            .ok_or_else(|| Error::not_found(format!("installplans {:?} not found", name)))
    }

    async fn update_install_plan(&self, namespace: &str, plan: &InstallPlan) -> Result<()> {
        self.check_reachable()?;
        self.plan_updates.fetch_add(1, Ordering::SeqCst);
        let name = plan.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if !state.install_plans.contains_key(&key(namespace, &name)) {
            return Err(Error::not_found(format!("installplans {:?} not found", name)));
        }
        state.install_plans.insert(key(namespace, &name), plan.clone());

        if !plan.spec.approved {
            return Ok(());
        }

        // Approval installs the CSV and starts the operator deployment
        let mut started = Vec::new();
        for ((ns, sub_name), subscription) in state.subscriptions.iter_mut() {
            if ns != namespace || subscription.install_plan_name() != Some(name.as_str()) {
                continue;
            }
            if let Some(status) = subscription.status.as_mut() {
                status.installed_csv = status.current_csv.clone();
                status.state = Some("AtLatestKnown".to_string());
                let version = status
                    .current_csv
                    .as_deref()
                    .and_then(|csv| csv.rsplit_once(".v"))
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_default();
                started.push((sub_name.clone(), subscription.spec.name.clone(), version));
            }
        }
        for (sub_name, package, version) in started {
            let image = format!("percona/{}:{}", package, version);
            state.deployments.insert(
                key(namespace, &sub_name),
                rolled_out_deployment(namespace, &sub_name, &image),
            );
        }
        Ok(())
    }

    async fn get_cluster_service_version(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterServiceVersion>> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .csvs
            .get(&key(namespace, name))
            .cloned())
    }
}

fn succeeded_csv(namespace: &str, name: &str) -> ClusterServiceVersion {
    ClusterServiceVersion {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: ClusterServiceVersionSpec::default(),
        status: Some(ClusterServiceVersionStatus {
            phase: Some("Succeeded".to_string()),
            message: None,
        }),
    }
}

/// [`ClientFactory`] handing out [`MockKubernetesClient`]s keyed by kubeconfig
#[derive(Clone, Default)]
pub struct MockClientFactory {
    clients: Arc<Mutex<HashMap<String, MockKubernetesClient>>>,
    refused: Arc<Mutex<HashSet<String>>>,
    connections: Arc<AtomicUsize>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `client` for connections using `kubeconfig`
    pub fn add_client(&self, kubeconfig: &str, client: MockKubernetesClient) {
        self.clients
            .lock()
            .unwrap()
            .insert(kubeconfig.to_string(), client);
    }

    /// Client served for `kubeconfig`, created on first use
    pub fn client(&self, kubeconfig: &str) -> MockKubernetesClient {
        self.clients
            .lock()
            .unwrap()
            .entry(kubeconfig.to_string())
            .or_default()
            .clone()
    }

    /// Fail every connection using `kubeconfig`
    pub fn refuse(&self, kubeconfig: &str) {
        self.refused.lock().unwrap().insert(kubeconfig.to_string());
    }

    /// Number of clients constructed
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ClientFactory for MockClientFactory {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn KubernetesClient>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        // give concurrent callers a chance to interleave
        tokio::task::yield_now().await;
        if self.refused.lock().unwrap().contains(kubeconfig) {
            return Err(Error::internal(
                "exec plugin: executable aws-iam-authenticator failed with exit code 1",
            ));
        }
        Ok(Arc::new(self.client(kubeconfig)))
    }
}

/// [`VersionResolver`] answering from a fixed table
#[derive(Clone, Default)]
pub struct StaticVersionService {
    entries: Arc<Mutex<HashMap<MatrixParams, Vec<VersionEntry>>>>,
    requests: Arc<AtomicUsize>,
}

impl StaticVersionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `params` with `entries`
    pub fn add(&self, params: MatrixParams, entries: Vec<VersionEntry>) {
        self.entries.lock().unwrap().insert(params, entries);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl VersionResolver for StaticVersionService {
    async fn matrix(&self, params: &MatrixParams) -> Result<VersionResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(VersionResponse {
            versions: self
                .entries
                .lock()
                .unwrap()
                .get(params)
                .cloned()
                .unwrap_or_default(),
        })
    }

    fn version_service_url(&self) -> String {
        "http://version-service.test".to_string()
    }
}

/// [`MonitoringCredentials`] recording minted and revoked keys
#[derive(Clone, Default)]
pub struct StaticCredentials {
    created: Arc<Mutex<Vec<String>>>,
    deleted: Arc<Mutex<Vec<i64>>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of created keys, in order
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    /// Ids of deleted keys, in order
    pub fn deleted(&self) -> Vec<i64> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MonitoringCredentials for StaticCredentials {
    async fn create_api_key(&self, name: &str) -> Result<ApiKey> {
        let mut created = self.created.lock().unwrap();
        created.push(name.to_string());
        Ok(ApiKey {
            id: created.len() as i64,
            key: format!("key-{}", created.len()),
        })
    }

    async fn delete_api_key(&self, id: i64) -> Result<()> {
        self.deleted.lock().unwrap().push(id);
        Ok(())
    }
}

//! Kubernetes cluster registration and inspection

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use rand::Rng;
use tracing::{error, info, instrument, warn};

use super::Context;
use crate::adapters::kubeconfig::{mask_secrets, replace_aws_auth};
use crate::adapters::resources::{all_resources, consumed_resources, detect_cluster_type};
use crate::adapters::{check_connection, ClusterConnection, ClusterType, KubernetesClient, Resources};
use crate::error::{Error, Result};
use crate::metrics::OPERATOR_INSTALLS;
use crate::monitoring::{start_monitoring, stop_monitoring, ApiKey};
use crate::olm::{InstallRequest, OperatorId};
use crate::store::ClusterRegistration;
use crate::version::{core_version, parse_version, LatestOperatorVersions};

/// Database operators reported by [`KubernetesService::list_clusters`]
const REPORTED_OPERATORS: [OperatorId; 2] = [OperatorId::Pxc, OperatorId::Psmdb];

/// Cluster onboarding request
#[derive(Clone, Debug, Default)]
pub struct RegisterRequest {
    pub name: String,
    pub kubeconfig: String,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
}

impl RegisterRequest {
    pub fn new(name: impl Into<String>, kubeconfig: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kubeconfig: kubeconfig.into(),
            ..Default::default()
        }
    }

    /// Credentials injected into an `aws-iam-authenticator` exec plugin
    pub fn with_aws_keys(mut self, key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.aws_access_key_id = Some(key_id.into()).filter(|k: &String| !k.is_empty());
        self.aws_secret_access_key = Some(secret.into()).filter(|k: &String| !k.is_empty());
        self
    }
}

/// What a freshly registered cluster still needs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapPlan {
    pub install_olm: bool,
    /// Operators to subscribe to, in install order
    pub operators: Vec<OperatorId>,
}

impl BootstrapPlan {
    /// Without OLM the platform operators are missing as well. Database
    /// operators are added when a recommended release exists and none is
    /// installed yet.
    pub fn for_connection(
        connection: &ClusterConnection,
        latest: Option<&LatestOperatorVersions>,
    ) -> Self {
        let operators = OperatorId::SUBSCRIBED
            .into_iter()
            .filter(|op| match op {
                OperatorId::Dbaas | OperatorId::VictoriaMetrics => !connection.olm_installed,
                db => {
                    latest.and_then(|l| l.get(*db)).is_some()
                        && connection.operator_version(*db).is_none()
                }
            })
            .collect();

        Self {
            install_olm: !connection.olm_installed,
            operators,
        }
    }
}

/// Health of a registered cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterStatus {
    Ok,
    /// Registered but the bootstrap did not finish
    Provisioning,
    /// The API server did not answer
    Unavailable,
}

/// Install and compatibility state of one operator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorStatus {
    NotInstalled,
    Ok,
    /// Installed but not published for this platform release
    Unsupported,
    /// Installed with a version that can not be parsed
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorInfo {
    pub status: OperatorStatus,
    pub version: Option<String>,
}

/// One entry of [`KubernetesService::list_clusters`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSummary {
    pub name: String,
    pub status: ClusterStatus,
    /// Empty when the cluster is unavailable
    pub operators: BTreeMap<OperatorId, OperatorInfo>,
}

/// Registration as returned to callers, credentials masked
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterDetails {
    pub name: String,
    pub kubeconfig: String,
    pub is_ready: bool,
}

/// Capacity of a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterResources {
    pub cluster_type: ClusterType,
    pub all: Resources,
    pub available: Resources,
}

/// Cluster registration service
#[derive(Clone)]
pub struct KubernetesService {
    ctx: Arc<Context>,
}

impl KubernetesService {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Register a cluster and bootstrap it in the background.
    ///
    /// Returns once the registration is stored and the monitoring key is
    /// minted; the cluster turns ready when the bootstrap finishes.
    #[instrument(skip(self, request), fields(cluster = %request.name))]
    pub async fn register_cluster(&self, request: RegisterRequest) -> Result<()> {
        if request.name.trim().is_empty() {
            return Err(Error::invalid_argument("Kubernetes cluster name can't be empty"));
        }
        let kubeconfig = replace_aws_auth(
            &request.kubeconfig,
            request.aws_access_key_id.as_deref(),
            request.aws_secret_access_key.as_deref(),
        )?;

        if self.ctx.store.find_cluster(&request.name).await.is_ok() {
            return Err(Error::AlreadyExists(format!(
                "Kubernetes cluster with name {:?} already exists",
                request.name
            )));
        }

        let client = self.ctx.registry.connect(&kubeconfig).await?;
        let connection = check_connection(client.as_ref()).await?;
        info!(
            server_version = %connection.server_version,
            olm_installed = connection.olm_installed,
            "Connected to cluster"
        );

        let platform_version = core_version(&self.ctx.config.platform_version)?;
        let latest = self.ctx.versions.latest_operator_version(&platform_version).await?;
        let plan = BootstrapPlan::for_connection(&connection, latest.as_ref());

        let public_address = self.ctx.config.public_address.clone().ok_or_else(|| {
            Error::precondition("can not setup monitoring because public address is empty")
        })?;

        self.ctx
            .store
            .create_cluster(ClusterRegistration::new(&request.name, &kubeconfig))
            .await?;

        let key_name = format!(
            "pmm-vmagent-{}-{}",
            request.name,
            rand::thread_rng().gen_range(0..i64::MAX)
        );
        let api_key = match self.ctx.credentials.create_api_key(&key_name).await {
            Ok(key) => key,
            Err(e) => {
                self.ctx.store.remove_cluster(&request.name).await?;
                return Err(Error::internal(format!("cannot create monitoring API key: {}", e)));
            }
        };

        let ctx = self.ctx.clone();
        let name = request.name.clone();
        let started = self.ctx.launcher.spawn("setup-monitoring", async move {
            setup_monitoring(&ctx, &name, client, &plan, &public_address, api_key).await;
        });
        if !started {
            return Err(Error::internal("shutting down, cluster bootstrap not started"));
        }

        info!("Cluster registered, bootstrap started");
        Ok(())
    }

    /// Remove a registration.
    ///
    /// Without `force` the cluster must not run any database cluster, and
    /// nothing is touched when it does. Clusters without the DatabaseCluster
    /// resource count as empty. With `force` a cluster that can no longer be
    /// reached is removed without stopping its monitoring.
    #[instrument(skip(self))]
    pub async fn unregister_cluster(&self, name: &str, force: bool) -> Result<()> {
        let client = if force {
            self.ctx.store.find_cluster(name).await?;
            match self.ctx.client(name).await {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(error = %e, "Cannot connect to cluster, monitoring left in place");
                    None
                }
            }
        } else {
            let client = self.ctx.client(name).await?;
            ensure_no_database_clusters(name, client.as_ref()).await?;
            Some(client)
        };

        if let Some(client) = client {
            if let Err(e) = stop_monitoring(client.as_ref()).await {
                warn!(error = %e, "Cannot stop monitoring");
            }
        }

        self.ctx.registry.delete_client(name).await
    }

    /// Every registration with its connectivity and operator state
    pub async fn list_clusters(&self) -> Result<Vec<ClusterSummary>> {
        let registrations = self.ctx.store.list_clusters().await?;
        if registrations.is_empty() {
            return Ok(Vec::new());
        }

        let supported = self
            .ctx
            .versions
            .supported_operator_versions_list(&self.ctx.config.platform_version)
            .await?;

        let probes = registrations
            .iter()
            .map(|registration| self.summarize(registration, &supported));
        Ok(join_all(probes).await)
    }

    async fn summarize(
        &self,
        registration: &ClusterRegistration,
        supported: &HashMap<OperatorId, Vec<String>>,
    ) -> ClusterSummary {
        let mut summary = ClusterSummary {
            name: registration.name.clone(),
            status: ClusterStatus::Unavailable,
            operators: BTreeMap::new(),
        };

        let connection = match self.ctx.client(&registration.name).await {
            Ok(client) => check_connection(client.as_ref()).await,
            Err(e) => Err(e),
        };
        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                warn!(cluster = %registration.name, error = %e, "Cluster unavailable");
                return summary;
            }
        };

        summary.status = if registration.is_ready {
            ClusterStatus::Ok
        } else {
            ClusterStatus::Provisioning
        };
        for operator in REPORTED_OPERATORS {
            let version = connection.operator_version(operator).map(str::to_string);
            let status = operator_status(
                supported.get(&operator).map(Vec::as_slice).unwrap_or_default(),
                version.as_deref(),
                self.ctx.config.allow_unsupported_operators,
            );
            summary.operators.insert(operator, OperatorInfo { status, version });
        }
        summary
    }

    /// Registration with credentials masked
    pub async fn get_cluster(&self, name: &str) -> Result<ClusterDetails> {
        let registration = self.ctx.store.find_cluster(name).await?;
        Ok(ClusterDetails {
            kubeconfig: mask_secrets(&registration.kubeconfig)?,
            name: registration.name,
            is_ready: registration.is_ready,
        })
    }

    /// Total and still available capacity
    pub async fn get_resources(&self, name: &str) -> Result<ClusterResources> {
        let client = self.ctx.client(name).await?;

        let nodes = client.list_nodes().await?;
        let cluster_type = detect_cluster_type(&nodes);
        let volumes = match cluster_type {
            ClusterType::Eks => client.list_persistent_volumes().await?,
            _ => Vec::new(),
        };
        let pods = client.list_pods().await?;

        let all = all_resources(cluster_type, &nodes, &volumes)?;
        let consumed = consumed_resources(cluster_type, &pods, &volumes)?;
        Ok(ClusterResources {
            cluster_type,
            all,
            available: all.saturating_sub(&consumed),
        })
    }

    /// Names of the storage classes of a cluster
    pub async fn list_storage_classes(&self, name: &str) -> Result<Vec<String>> {
        let client = self.ctx.client(name).await?;
        Ok(client
            .list_storage_classes()
            .await?
            .into_iter()
            .filter_map(|sc| sc.metadata.name)
            .collect())
    }
}

async fn ensure_no_database_clusters(name: &str, client: &dyn KubernetesClient) -> Result<()> {
    match client.list_database_clusters().await {
        Err(e) if e.is_access_error() => {
            warn!(error = %e, "Cannot list database clusters, removing anyway");
            Ok(())
        }
        Err(e) => Err(e),
        Ok(clusters) if !clusters.is_empty() => Err(Error::precondition(format!(
            "Kubernetes cluster {} has database clusters",
            name
        ))),
        Ok(_) => Ok(()),
    }
}

fn operator_status(supported: &[String], version: Option<&str>, allow_unsupported: bool) -> OperatorStatus {
    let Some(version) = version else {
        return OperatorStatus::NotInstalled;
    };
    if parse_version(version).is_err() {
        return OperatorStatus::Invalid;
    }
    if allow_unsupported || supported.iter().any(|v| v == version) {
        OperatorStatus::Ok
    } else {
        OperatorStatus::Unsupported
    }
}

/// Bootstrap a registered cluster and start its monitoring agent.
///
/// Runs detached from the registration request. Operator failures are
/// collected per operator and returned; the cluster is marked ready unless
/// OLM or the VictoriaMetrics operator failed.
pub async fn setup_monitoring(
    ctx: &Context,
    cluster: &str,
    client: Arc<dyn KubernetesClient>,
    plan: &BootstrapPlan,
    public_address: &str,
    api_key: ApiKey,
) -> HashMap<OperatorId, Error> {
    let errors = install_operators(ctx, cluster, client.clone(), plan).await;
    if errors.contains_key(&OperatorId::Olm) {
        return errors;
    }
    if let Some(e) = errors.get(&OperatorId::VictoriaMetrics) {
        error!(cluster = %cluster, error = %e, "Cannot install vm operator, monitoring not started");
        return errors;
    }

    if let Err(e) = start_monitoring(client.as_ref(), public_address, &api_key.key).await {
        if let Err(delete_err) = ctx.credentials.delete_api_key(api_key.id).await {
            warn!(cluster = %cluster, key_id = api_key.id, error = %delete_err, "Cannot delete API key");
        }
        error!(cluster = %cluster, error = %e, "Cannot start monitoring of the cluster");
    }

    match ctx.store.set_cluster_ready(cluster, true).await {
        Ok(()) => info!(cluster = %cluster, "Cluster ready"),
        Err(e) => error!(cluster = %cluster, error = %e, "Cannot mark cluster ready"),
    }
    errors
}

async fn install_operators(
    ctx: &Context,
    cluster: &str,
    client: Arc<dyn KubernetesClient>,
    plan: &BootstrapPlan,
) -> HashMap<OperatorId, Error> {
    let bootstrap = ctx.bootstrap(client);
    let mut errors = HashMap::new();

    if plan.install_olm {
        if let Err(e) = bootstrap.install_olm().await {
            error!(cluster = %cluster, error = %e, "Cannot install OLM");
            OPERATOR_INSTALLS
                .with_label_values(&[OperatorId::Olm.key(), "failure"])
                .inc();
            errors.insert(OperatorId::Olm, e);
            return errors;
        }
        OPERATOR_INSTALLS
            .with_label_values(&[OperatorId::Olm.key(), "success"])
            .inc();
    }

    for &operator in &plan.operators {
        let request = InstallRequest::for_operator(operator, ctx.config.channel(operator));
        match bootstrap.install_operator(&request).await {
            Ok(()) => {
                OPERATOR_INSTALLS
                    .with_label_values(&[operator.key(), "success"])
                    .inc();
            }
            Err(e) => {
                error!(cluster = %cluster, operator = %operator, error = %e, "Cannot install operator");
                OPERATOR_INSTALLS
                    .with_label_values(&[operator.key(), "failure"])
                    .inc();
                errors.insert(operator, e);
            }
        }
    }

    errors
}

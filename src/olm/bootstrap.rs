//! OLM installation and operator subscription workflow

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::ObjectMeta;
use tracing::{debug, info, instrument};

use super::wait::{poll_until, PollSettings};
use super::{InstallRequest, OperatorId};
use crate::adapters::kube_client::KubernetesClient;
use crate::adapters::manifests::{self, Manifest};
use crate::crd::{OperatorGroup, OperatorGroupSpec, Subscription, SubscriptionSpec};
use crate::error::{Error, Result};

/// Namespace OLM runs in
pub const OLM_NAMESPACE: &str = "olm";

const CRDS_MANIFEST: &str = include_str!("../../manifests/olm/crds.yaml");
const OLM_MANIFEST: &str = include_str!("../../manifests/olm/olm.yaml");
const CATALOG_MANIFEST: &str = include_str!("../../manifests/olm/catalog.yaml");

/// Deployments that make up OLM core
const OLM_DEPLOYMENTS: [&str; 2] = ["olm-operator", "catalog-operator"];

/// Deployment serving the package API, ready last
const PACKAGE_SERVER: &str = "packageserver";

/// Progress of one bootstrap step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    NotInstalled,
    OlmInstalling,
    OlmReady,
    SubscriptionPending,
    InstallPlanPending,
    Approved,
    Installed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapState::NotInstalled => "NotInstalled",
            BootstrapState::OlmInstalling => "OLMInstalling",
            BootstrapState::OlmReady => "OLMReady",
            BootstrapState::SubscriptionPending => "SubscriptionPending",
            BootstrapState::InstallPlanPending => "InstallPlanPending",
            BootstrapState::Approved => "Approved",
            BootstrapState::Installed => "Installed",
        };
        f.write_str(s)
    }
}

/// Installs OLM and operators in one cluster
#[derive(Clone)]
pub struct OlmBootstrap {
    client: Arc<dyn KubernetesClient>,
    poll: PollSettings,
}

impl OlmBootstrap {
    /// Bootstrap with the default 1s / 5m polling
    pub fn new(client: Arc<dyn KubernetesClient>) -> Self {
        Self::with_poll(client, PollSettings::default())
    }

    pub fn with_poll(client: Arc<dyn KubernetesClient>, poll: PollSettings) -> Self {
        Self { client, poll }
    }

    /// True when the OLM operator deployment exists
    pub async fn is_olm_installed(&self) -> Result<bool> {
        Ok(self
            .client
            .get_deployment(OLM_NAMESPACE, OperatorId::Olm.package())
            .await?
            .is_some())
    }

    /// Install OLM unless it is already running.
    ///
    /// Fails when any OLM deployment or bundled subscription does not become
    /// ready within the poll bound.
    #[instrument(skip(self))]
    pub async fn install_olm(&self) -> Result<()> {
        if self.is_olm_installed().await? {
            info!(state = %BootstrapState::OlmReady, "OLM already installed");
            return Ok(());
        }

        info!(state = %BootstrapState::OlmInstalling, "Installing OLM");

        let mut applied = Vec::new();
        for (bundle, yaml) in [
            ("crds", CRDS_MANIFEST),
            ("olm", OLM_MANIFEST),
            ("catalog", CATALOG_MANIFEST),
        ] {
            let documents = manifests::parse_documents(yaml)?;
            self.apply_all(&documents).await.map_err(|e| {
                Error::internal(format!("cannot apply OLM {} bundle: {}", bundle, e))
            })?;
            debug!(bundle, objects = documents.len(), "Applied OLM bundle");
            applied.extend(documents);
        }

        for deployment in OLM_DEPLOYMENTS {
            self.wait_for_rollout(OLM_NAMESPACE, deployment).await?;
        }

        for (namespace, name) in manifests::subscriptions(&applied) {
            info!(subscription = %name, "Waiting for subscription to install CSV");
            let csv = self.wait_for_subscription_csv(&namespace, &name).await?;
            info!(csv = %csv, "Waiting for CSV to reach Succeeded");
            self.wait_for_csv(&namespace, &csv).await?;
        }

        self.wait_for_rollout(OLM_NAMESPACE, PACKAGE_SERVER).await?;

        info!(state = %BootstrapState::OlmReady, "OLM installed");
        Ok(())
    }

    /// Subscribe to an operator and approve its first install plan
    #[instrument(skip(self, req), fields(operator = %req.name, channel = %req.channel))]
    pub async fn install_operator(&self, req: &InstallRequest) -> Result<()> {
        self.ensure_operator_group(&req.namespace, &req.operator_group)
            .await?;

        info!(state = %BootstrapState::SubscriptionPending, "Creating subscription");
        let subscription = Subscription {
            metadata: ObjectMeta {
                name: Some(req.name.clone()),
                namespace: Some(req.namespace.clone()),
                ..Default::default()
            },
            spec: SubscriptionSpec {
                source: req.catalog_source.clone(),
                source_namespace: req.catalog_source_namespace.clone(),
                name: req.name.clone(),
                channel: Some(req.channel.clone()),
                starting_csv: req.starting_csv.clone(),
                install_plan_approval: Some(req.approval),
            },
            status: None,
        };
        self.client
            .create_subscription(&req.namespace, &subscription)
            .await?;

        info!(state = %BootstrapState::InstallPlanPending, "Waiting for install plan");
        let plan = self.wait_for_install_plan(&req.namespace, &req.name).await?;
        self.approve_install_plan(&req.namespace, &plan).await?;

        info!(state = %BootstrapState::Installed, install_plan = %plan, "Operator installed");
        Ok(())
    }

    /// Approve the pending install plan of an existing subscription.
    ///
    /// Returns `false` when the plan is already approved, meaning there is
    /// no upgrade to apply.
    #[instrument(skip(self))]
    pub async fn upgrade_operator(&self, namespace: &str, name: &str) -> Result<bool> {
        let plan = self.wait_for_install_plan(namespace, name).await?;
        self.approve_install_plan(namespace, &plan).await
    }

    /// Set `spec.approved` on an install plan. `false` if it already was.
    pub async fn approve_install_plan(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut plan = self.client.get_install_plan(namespace, name).await?;
        if plan.spec.approved {
            debug!(install_plan = %name, "Install plan already approved");
            return Ok(false);
        }

        plan.spec.approved = true;
        self.client.update_install_plan(namespace, &plan).await?;
        info!(install_plan = %name, state = %BootstrapState::Approved, "Install plan approved");
        Ok(true)
    }

    /// Poll a subscription until OLM references an install plan from it
    pub async fn wait_for_install_plan(&self, namespace: &str, name: &str) -> Result<String> {
        let what = format!("install plan for subscription {}/{}", namespace, name);
        poll_until(self.poll, &what, move || async move {
            let subscription = self.client.get_subscription(namespace, name).await?;
            Ok(subscription
                .as_ref()
                .and_then(|s| s.install_plan_name())
                .map(str::to_string))
        })
        .await
    }

    /// Poll a subscription until it names the CSV it installs
    pub async fn wait_for_subscription_csv(&self, namespace: &str, name: &str) -> Result<String> {
        let what = format!("subscription {}/{} to install a CSV", namespace, name);
        poll_until(self.poll, &what, move || async move {
            let subscription = self.client.get_subscription(namespace, name).await?;
            Ok(subscription
                .and_then(|s| s.status)
                .and_then(|s| s.installed_csv.or(s.current_csv))
                .filter(|csv| !csv.is_empty()))
        })
        .await
    }

    /// Poll a CSV until its phase is `Succeeded`; `Failed` aborts early
    pub async fn wait_for_csv(&self, namespace: &str, name: &str) -> Result<()> {
        let what = format!("clusterserviceversion {}/{} to reach Succeeded", namespace, name);
        poll_until(self.poll, &what, move || async move {
            match self.client.get_cluster_service_version(namespace, name).await? {
                Some(csv) if csv.succeeded() => Ok(Some(())),
                Some(csv) if csv.failed() => Err(Error::internal(format!(
                    "clusterserviceversion {}/{} failed: {}",
                    namespace,
                    name,
                    csv.status.and_then(|s| s.message).unwrap_or_default()
                ))),
                _ => Ok(None),
            }
        })
        .await
    }

    /// Poll a deployment until its rollout finished
    pub async fn wait_for_rollout(&self, namespace: &str, name: &str) -> Result<()> {
        let what = format!("deployment {}/{} rollout", namespace, name);
        poll_until(self.poll, &what, move || async move {
            let deployment = self.client.get_deployment(namespace, name).await?;
            Ok(deployment.filter(rollout_complete).map(|_| ()))
        })
        .await
    }

    async fn ensure_operator_group(&self, namespace: &str, name: &str) -> Result<()> {
        if self.client.get_operator_group(namespace, name).await?.is_some() {
            return Ok(());
        }

        let group = OperatorGroup {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: OperatorGroupSpec {
                target_namespaces: vec![namespace.to_string()],
            },
        };
        self.client.create_operator_group(namespace, &group).await?;
        info!(operator_group = %name, namespace = %namespace, "Created operator group");
        Ok(())
    }

    async fn apply_all(&self, documents: &[Manifest]) -> Result<()> {
        for document in documents {
            self.client.apply(document).await?;
        }
        Ok(())
    }
}

/// Same readiness rule `kubectl rollout status` uses
pub(crate) fn rollout_complete(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or(0);

    let Some(status) = &deployment.status else {
        return false;
    };

    status.observed_generation.unwrap_or(0) >= generation
        && status.updated_replicas.unwrap_or(0) >= desired
        && status.available_replicas.unwrap_or(0) >= desired
        && status.replicas.unwrap_or(0) <= status.updated_replicas.unwrap_or(0)
}

//! Kubernetes API access for registered clusters
//!
//! Workflows talk to clusters through [`KubernetesClient`] so they can be
//! exercised against the in-memory mock. [`KubeClient`] is the kube-rs
//! implementation built from a stored kubeconfig.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::adapters::manifests::Manifest;
use crate::crd::{ClusterServiceVersion, DatabaseCluster, InstallPlan, OperatorGroup, Subscription};
use crate::error::{Error, Result};
use crate::olm::{OperatorId, OLM_NAMESPACE, OPERATORS_NAMESPACE};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "dbaas-controlplane";

/// Operations the control plane performs against a registered cluster
#[async_trait::async_trait]
pub trait KubernetesClient: Send + Sync {
    /// API server version string
    async fn server_version(&self) -> Result<String>;

    /// Deployment by name, `None` when absent
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    // Database clusters
    async fn list_database_clusters(&self) -> Result<Vec<DatabaseCluster>>;
    async fn get_database_cluster(&self, namespace: &str, name: &str) -> Result<DatabaseCluster>;

    // Capacity
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn list_pods(&self) -> Result<Vec<Pod>>;
    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>>;

    /// Server-side apply one manifest document
    async fn apply(&self, manifest: &Manifest) -> Result<()>;

    /// Delete the object a manifest describes; absent objects are fine
    async fn delete(&self, manifest: &Manifest) -> Result<()>;

    // OLM
    async fn get_operator_group(&self, namespace: &str, name: &str) -> Result<Option<OperatorGroup>>;
    async fn create_operator_group(&self, namespace: &str, group: &OperatorGroup) -> Result<()>;
    async fn get_subscription(&self, namespace: &str, name: &str) -> Result<Option<Subscription>>;
    async fn create_subscription(&self, namespace: &str, subscription: &Subscription) -> Result<()>;
    async fn list_subscriptions(&self, namespace: &str) -> Result<Vec<Subscription>>;
    async fn get_install_plan(&self, namespace: &str, name: &str) -> Result<InstallPlan>;
    async fn update_install_plan(&self, namespace: &str, plan: &InstallPlan) -> Result<()>;
    async fn get_cluster_service_version(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterServiceVersion>>;
}

/// Builds clients from stored kubeconfigs
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn KubernetesClient>>;
}

/// [`ClientFactory`] producing [`KubeClient`]s
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeClientFactory;

#[async_trait::async_trait]
impl ClientFactory for KubeClientFactory {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn KubernetesClient>> {
        Ok(Arc::new(KubeClient::from_kubeconfig(kubeconfig).await?))
    }
}

/// kube-rs backed client
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Build a client from a kubeconfig document
    pub async fn from_kubeconfig(kubeconfig: &str) -> Result<Self> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let client = Client::try_from(config)?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, manifest: &Manifest) -> Api<DynamicObject> {
        match &manifest.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &manifest.api_resource),
            None => Api::all_with(self.client.clone(), &manifest.api_resource),
        }
    }
}

#[async_trait::async_trait]
impl KubernetesClient for KubeClient {
    async fn server_version(&self) -> Result<String> {
        Ok(self.client.apiserver_version().await?.git_version)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_database_clusters(&self) -> Result<Vec<DatabaseCluster>> {
        let api: Api<DatabaseCluster> = Api::all(self.client.clone());
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items),
            // No CRD registered: the dbaas operator is not there yet
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::AccessDenied(
                "the server doesn't have a resource type \"DatabaseCluster\"".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_database_cluster(&self, namespace: &str, name: &str) -> Result<DatabaseCluster> {
        let api: Api<DatabaseCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn apply(&self, manifest: &Manifest) -> Result<()> {
        debug!(kind = %manifest.kind(), name = %manifest.name, "Applying manifest");
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.dynamic_api(manifest)
            .patch(&manifest.name, &params, &Patch::Apply(&manifest.value))
            .await?;
        Ok(())
    }

    async fn delete(&self, manifest: &Manifest) -> Result<()> {
        match self
            .dynamic_api(manifest)
            .delete(&manifest.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_operator_group(&self, namespace: &str, name: &str) -> Result<Option<OperatorGroup>> {
        let api: Api<OperatorGroup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_operator_group(&self, namespace: &str, group: &OperatorGroup) -> Result<()> {
        let api: Api<OperatorGroup> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), group).await?;
        Ok(())
    }

    async fn get_subscription(&self, namespace: &str, name: &str) -> Result<Option<Subscription>> {
        let api: Api<Subscription> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_subscription(&self, namespace: &str, subscription: &Subscription) -> Result<()> {
        let api: Api<Subscription> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), subscription).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_subscriptions(&self, namespace: &str) -> Result<Vec<Subscription>> {
        let api: Api<Subscription> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_install_plan(&self, namespace: &str, name: &str) -> Result<InstallPlan> {
        let api: Api<InstallPlan> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn update_install_plan(&self, namespace: &str, plan: &InstallPlan) -> Result<()> {
        let name = plan
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::invalid_argument("install plan without a name"))?;
        let api: Api<InstallPlan> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), plan).await?;
        Ok(())
    }

    async fn get_cluster_service_version(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterServiceVersion>> {
        let api: Api<ClusterServiceVersion> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Result of probing a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterConnection {
    pub server_version: String,
    pub olm_installed: bool,
    pub pxc_operator_version: Option<String>,
    pub psmdb_operator_version: Option<String>,
}

impl ClusterConnection {
    /// Installed version of a database operator
    pub fn operator_version(&self, operator: OperatorId) -> Option<&str> {
        match operator {
            OperatorId::Pxc => self.pxc_operator_version.as_deref(),
            OperatorId::Psmdb => self.psmdb_operator_version.as_deref(),
            _ => None,
        }
    }
}

/// Check that the cluster answers and which operators run in it
pub async fn check_connection(client: &dyn KubernetesClient) -> Result<ClusterConnection> {
    let server_version = client.server_version().await?;
    let olm_installed = client
        .get_deployment(OLM_NAMESPACE, OperatorId::Olm.package())
        .await?
        .is_some();

    Ok(ClusterConnection {
        server_version,
        olm_installed,
        pxc_operator_version: operator_version(client, OperatorId::Pxc).await?,
        psmdb_operator_version: operator_version(client, OperatorId::Psmdb).await?,
    })
}

/// Version of an operator taken from its deployment image tag
pub async fn operator_version(
    client: &dyn KubernetesClient,
    operator: OperatorId,
) -> Result<Option<String>> {
    let deployment = client
        .get_deployment(OPERATORS_NAMESPACE, operator.package())
        .await?;

    Ok(deployment.as_ref().and_then(deployment_image).and_then(image_tag))
}

fn deployment_image(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()
}

/// Tag part of an image reference, ignoring registry ports and digests
pub fn image_tag(image: &str) -> Option<String> {
    let image = image.split('@').next().unwrap_or(image);
    let last = image.rsplit('/').next().unwrap_or(image);
    last.split_once(':')
        .map(|(_, tag)| tag.to_string())
        .filter(|tag| !tag.is_empty())
}

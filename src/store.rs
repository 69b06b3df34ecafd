//! Persistence of cluster registrations and database cluster records
//!
//! Storage itself lives outside the control plane; workflows only see the
//! [`ClusterStore`] capability. [`MemoryStore`] keeps everything in process.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::crd::Engine;
use crate::error::{Error, Result};

/// Locally stored default/disabled versions of one component
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_version: Option<String>,
    #[serde(default)]
    pub disabled_versions: Vec<String>,
}

/// Overrides keyed by component name (`pxc`, `mongod`, `proxysql`, ...)
pub type ComponentOverrides = BTreeMap<String, ComponentOverride>;

/// A registered Kubernetes cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistration {
    pub name: String,
    pub kubeconfig: String,
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default)]
    pub components: ComponentOverrides,
}

impl ClusterRegistration {
    pub fn new(name: impl Into<String>, kubeconfig: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kubeconfig: kubeconfig.into(),
            is_ready: false,
            components: ComponentOverrides::new(),
        }
    }

    /// Stored default version of a component, if one was chosen
    pub fn default_version(&self, component: &str) -> Option<&str> {
        self.components
            .get(component)
            .and_then(|c| c.default_version.as_deref())
    }
}

/// Locally tracked database cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbClusterRecord {
    /// Registered Kubernetes cluster the database runs in
    pub cluster: String,
    pub name: String,
    pub engine: Engine,
    pub namespace: String,
    #[serde(default)]
    pub installed_image: String,
}

impl DbClusterRecord {
    pub fn key(&self) -> DbClusterKey {
        DbClusterKey {
            cluster: self.cluster.clone(),
            name: self.name.clone(),
            engine: self.engine,
        }
    }
}

/// Identity of a database cluster record
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DbClusterKey {
    pub cluster: String,
    pub name: String,
    pub engine: Engine,
}

/// Mutation applied to a registration's component overrides
pub type ComponentsUpdate = Box<dyn FnOnce(&mut ComponentOverrides) -> Result<()> + Send>;

/// Storage capability for registrations and inventory
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    /// Insert a registration; `AlreadyExists` when the name is taken
    async fn create_cluster(&self, registration: ClusterRegistration) -> Result<()>;
    /// `NotFound` when absent
    async fn find_cluster(&self, name: &str) -> Result<ClusterRegistration>;
    async fn list_clusters(&self) -> Result<Vec<ClusterRegistration>>;
    async fn set_cluster_ready(&self, name: &str, ready: bool) -> Result<()>;
    /// Remove a registration together with its database records
    async fn remove_cluster(&self, name: &str) -> Result<()>;
    /// Apply `update` to a copy of the overrides, committing only on success
    async fn update_components(&self, name: &str, update: ComponentsUpdate) -> Result<ComponentOverrides>;

    async fn upsert_db_cluster(&self, record: DbClusterRecord) -> Result<()>;
    async fn find_db_cluster(&self, key: &DbClusterKey) -> Result<DbClusterRecord>;
    async fn list_db_clusters(&self, cluster: &str) -> Result<Vec<DbClusterRecord>>;
    async fn remove_db_cluster(&self, key: &DbClusterKey) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    clusters: BTreeMap<String, ClusterRegistration>,
    db_clusters: HashMap<DbClusterKey, DbClusterRecord>,
}

/// In-process [`ClusterStore`]
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cluster_not_found(name: &str) -> Error {
    Error::not_found(format!("Kubernetes cluster with name {:?} not found", name))
}

#[async_trait::async_trait]
impl ClusterStore for MemoryStore {
    async fn create_cluster(&self, registration: ClusterRegistration) -> Result<()> {
        let mut state = self.state.write().await;
        if state.clusters.contains_key(&registration.name) {
            return Err(Error::AlreadyExists(format!(
                "Kubernetes cluster with name {:?} already exists",
                registration.name
            )));
        }
        state.clusters.insert(registration.name.clone(), registration);
        Ok(())
    }

    async fn find_cluster(&self, name: &str) -> Result<ClusterRegistration> {
        self.state
            .read()
            .await
            .clusters
            .get(name)
            .cloned()
            .ok_or_else(|| cluster_not_found(name))
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRegistration>> {
        Ok(self.state.read().await.clusters.values().cloned().collect())
    }

    async fn set_cluster_ready(&self, name: &str, ready: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let cluster = state
            .clusters
            .get_mut(name)
            .ok_or_else(|| cluster_not_found(name))?;
        cluster.is_ready = ready;
        Ok(())
    }

    async fn remove_cluster(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.clusters.remove(name).is_none() {
            return Err(cluster_not_found(name));
        }
        state.db_clusters.retain(|key, _| key.cluster != name);
        Ok(())
    }

    async fn update_components(&self, name: &str, update: ComponentsUpdate) -> Result<ComponentOverrides> {
        let mut state = self.state.write().await;
        let cluster = state
            .clusters
            .get_mut(name)
            .ok_or_else(|| cluster_not_found(name))?;

        let mut components = cluster.components.clone();
        update(&mut components)?;
        cluster.components = components.clone();
        Ok(components)
    }

    async fn upsert_db_cluster(&self, record: DbClusterRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.clusters.contains_key(&record.cluster) {
            return Err(cluster_not_found(&record.cluster));
        }
        state.db_clusters.insert(record.key(), record);
        Ok(())
    }

    async fn find_db_cluster(&self, key: &DbClusterKey) -> Result<DbClusterRecord> {
        self.state
            .read()
            .await
            .db_clusters
            .get(key)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!(
                    "{} cluster {:?} in Kubernetes cluster {:?} not found",
                    key.engine, key.name, key.cluster
                ))
            })
    }

    async fn list_db_clusters(&self, cluster: &str) -> Result<Vec<DbClusterRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .db_clusters
            .values()
            .filter(|r| r.cluster == cluster)
            .cloned()
            .collect();
        records.sort_by_key(DbClusterRecord::key);
        Ok(records)
    }

    async fn remove_db_cluster(&self, key: &DbClusterKey) -> Result<()> {
        self.state.write().await.db_clusters.remove(key);
        Ok(())
    }
}

//! Request surface of the control plane
//!
//! Each service bundles the operations of one API group. Services share the
//! [`Context`] holding configuration and every injected collaborator.

mod components;
mod kubernetes;

pub use components::{ComponentsService, OperatorComponents};
pub use kubernetes::{
    setup_monitoring, BootstrapPlan, ClusterDetails, ClusterResources, ClusterStatus,
    ClusterSummary, KubernetesService, OperatorInfo, OperatorStatus, RegisterRequest,
};

use std::sync::Arc;

use crate::adapters::KubernetesClient;
use crate::config::Config;
use crate::error::Result;
use crate::monitoring::MonitoringCredentials;
use crate::olm::{OlmBootstrap, PollSettings};
use crate::registry::ClientRegistry;
use crate::store::ClusterStore;
use crate::tasks::TaskLauncher;
use crate::version::VersionResolver;

/// Shared context for all services and the reconciler
pub struct Context {
    pub config: Config,
    pub store: Arc<dyn ClusterStore>,
    pub registry: Arc<ClientRegistry>,
    pub versions: Arc<dyn VersionResolver>,
    pub credentials: Arc<dyn MonitoringCredentials>,
    pub launcher: TaskLauncher,
    /// Bound and cadence of every OLM wait
    pub poll: PollSettings,
}

impl Context {
    /// Create a new context with the default OLM polling
    pub fn new(
        config: Config,
        store: Arc<dyn ClusterStore>,
        registry: Arc<ClientRegistry>,
        versions: Arc<dyn VersionResolver>,
        credentials: Arc<dyn MonitoringCredentials>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            versions,
            credentials,
            launcher: TaskLauncher::new(),
            poll: PollSettings::default(),
        }
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// OLM workflow bound to one cluster
    pub fn bootstrap(&self, client: Arc<dyn KubernetesClient>) -> OlmBootstrap {
        OlmBootstrap::with_poll(client, self.poll)
    }

    /// Client of a registered cluster
    pub async fn client(&self, cluster: &str) -> Result<Arc<dyn KubernetesClient>> {
        self.registry.get_or_set_client(cluster).await
    }
}

//! Per-cluster client cache

use std::sync::Arc;

use tracing::{debug, info};

use crate::adapters::{ClientFactory, KubernetesClient};
use crate::error::Result;
use crate::keyed_store::KeyedStore;
use crate::store::ClusterStore;

/// Maps a registered cluster name to one live client
pub struct ClientRegistry {
    store: Arc<dyn ClusterStore>,
    factory: Arc<dyn ClientFactory>,
    clients: KeyedStore<String, Arc<dyn KubernetesClient>>,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn ClusterStore>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            store,
            factory,
            clients: KeyedStore::new(),
        }
    }

    /// Cached client for `name`, built from the stored kubeconfig on a miss.
    ///
    /// Credential lookup and connection errors are returned as they are.
    pub async fn get_or_set_client(&self, name: &str) -> Result<Arc<dyn KubernetesClient>> {
        self.clients
            .get_or_try_insert_with(name.to_string(), || async {
                let registration = self.store.find_cluster(name).await?;
                let client = self.factory.connect(&registration.kubeconfig).await?;
                debug!(cluster = %name, "Created client");
                Ok(client)
            })
            .await
    }

    /// Build a client that is not cached, for clusters not registered yet
    pub async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn KubernetesClient>> {
        self.factory.connect(kubeconfig).await
    }

    /// Drop the cached client and the stored registration.
    ///
    /// This is the only way a cached client is invalidated.
    pub async fn delete_client(&self, name: &str) -> Result<()> {
        if self.clients.remove(&name.to_string()).await.is_some() {
            debug!(cluster = %name, "Evicted client");
        }
        self.store.remove_cluster(name).await?;
        info!(cluster = %name, "Removed cluster registration");
        Ok(())
    }
}

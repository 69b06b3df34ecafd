//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dbaas_controlplane::config::Config;
use dbaas_controlplane::mock::{MockClientFactory, MockKubernetesClient, StaticCredentials, StaticVersionService};
use dbaas_controlplane::olm::PollSettings;
use dbaas_controlplane::registry::ClientRegistry;
use dbaas_controlplane::services::Context;
use dbaas_controlplane::store::{ClusterRegistration, ClusterStore, MemoryStore};
use dbaas_controlplane::version::{ComponentVersion, Matrix, MatrixParams, VersionEntry, PLATFORM_PRODUCT};

pub const KUBECONFIG: &str = "apiVersion: v1\nkind: Config\nusers: []\n";
pub const PLATFORM_VERSION: &str = "2.30.0";

/// Everything a test needs to drive the services and inspect the fakes
pub struct Harness {
    pub ctx: Arc<Context>,
    pub store: Arc<MemoryStore>,
    pub factory: MockClientFactory,
    pub versions: StaticVersionService,
    pub credentials: StaticCredentials,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let factory = MockClientFactory::new();
        let versions = StaticVersionService::new();
        let credentials = StaticCredentials::new();

        let registry = Arc::new(ClientRegistry::new(store.clone(), Arc::new(factory.clone())));
        let ctx = Context::new(
            config,
            store.clone(),
            registry,
            Arc::new(versions.clone()),
            Arc::new(credentials.clone()),
        )
        .with_poll(PollSettings {
            interval: Duration::from_millis(5),
            timeout: Duration::from_secs(2),
        });

        Self {
            ctx: Arc::new(ctx),
            store,
            factory,
            versions,
            credentials,
        }
    }

    /// Client answering for [`KUBECONFIG`]
    pub fn client(&self) -> MockKubernetesClient {
        self.factory.client(KUBECONFIG)
    }

    /// Store a registration directly, skipping the bootstrap
    pub async fn add_cluster(&self, name: &str, kubeconfig: &str) {
        let mut registration = ClusterRegistration::new(name, kubeconfig);
        registration.is_ready = true;
        self.store.create_cluster(registration).await.unwrap();
    }

    /// Publish the operator versions of the test platform release
    pub fn publish_platform(&self) {
        let mut matrix = Matrix::default();
        matrix.pxc_operator.insert("1.10.0".into(), component("available", ""));
        matrix.pxc_operator.insert("1.11.0".into(), component("recommended", ""));
        matrix.psmdb_operator.insert("1.12.0".into(), component("recommended", ""));

        self.versions.add(
            MatrixParams::new(PLATFORM_PRODUCT).with_product_version(PLATFORM_VERSION),
            vec![VersionEntry {
                product: PLATFORM_PRODUCT.to_string(),
                product_version: PLATFORM_VERSION.to_string(),
                matrix,
            }],
        );
    }
}

pub fn test_config() -> Config {
    Config {
        platform_version: PLATFORM_VERSION.to_string(),
        public_address: Some("pmm.example.com".to_string()),
        ..Config::default()
    }
}

pub fn component(status: &str, image: &str) -> ComponentVersion {
    ComponentVersion {
        image_path: image.to_string(),
        status: status.to_string(),
        ..Default::default()
    }
}

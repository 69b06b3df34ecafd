//! Adapters between the control plane and registered Kubernetes clusters

pub mod kube_client;
pub mod kubeconfig;
pub mod manifests;
pub mod resources;

pub use kube_client::{
    check_connection, ClientFactory, ClusterConnection, KubeClient, KubeClientFactory,
    KubernetesClient,
};
pub use manifests::Manifest;
pub use resources::{ClusterType, Resources};

//! Custom resources the control plane reads and writes in registered clusters

mod database_cluster;
mod olm;

pub use database_cluster::*;
pub use olm::*;

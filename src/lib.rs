//! Percona DBaaS control plane
//!
//! Registers Kubernetes clusters, bootstraps the database operators on them
//! through OLM, resolves component versions against the version service and
//! keeps an inventory of the database clusters each of them runs.

pub mod adapters;
pub mod config;
pub mod crd;
pub mod error;
pub mod keyed_store;
pub mod metrics;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod monitoring;
pub mod olm;
pub mod reconcilers;
pub mod registry;
pub mod services;
pub mod store;
pub mod tasks;
pub mod version;

pub use error::{Error, Result};

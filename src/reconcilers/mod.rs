//! Background reconcilers
//!
//! Reconcilers run for the lifetime of the process and keep local state in
//! line with what the registered clusters report.

pub mod db_clusters;

pub use db_clusters::DbClusterSynchronizer;

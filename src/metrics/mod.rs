//! Prometheus metrics for the control plane
//!
//! Collectors are process-wide; the HTTP endpoint also answers health and
//! readiness probes.

mod prometheus;

pub use prometheus::*;

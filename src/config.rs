//! Environment-driven configuration
//!
//! Every knob has a default so the control plane can start against a local
//! cluster without any setup.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::olm::OperatorId;

/// Default version service endpoint
pub const DEFAULT_VERSION_SERVICE_URL: &str = "https://check.percona.com/versions/v1";

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default Grafana endpoint used to mint monitoring API keys
pub const DEFAULT_GRAFANA_URL: &str = "http://127.0.0.1:3000";

/// Control plane configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the version matrix service
    pub version_service_url: String,
    /// Version of the monitoring platform this control plane belongs to
    pub platform_version: String,
    /// Address the in-cluster monitoring agent pushes metrics to
    pub public_address: Option<String>,
    /// Accept operator versions that are not on the published list
    pub allow_unsupported_operators: bool,
    /// Per-operator OLM channel overrides
    pub channels: HashMap<OperatorId, String>,
    /// Port of the metrics/health endpoint
    pub metrics_port: u16,
    /// Period of the full inventory sync
    pub sync_interval: Duration,
    /// Period of the deletion sweep
    pub deletion_sweep_interval: Duration,
    /// Grafana base URL
    pub grafana_url: String,
    /// Authorization header sent to Grafana
    pub grafana_auth: Option<String>,
    /// Directory of kubeconfigs registered at startup
    pub kubeconfig_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version_service_url: DEFAULT_VERSION_SERVICE_URL.to_string(),
            platform_version: env!("CARGO_PKG_VERSION").to_string(),
            public_address: None,
            allow_unsupported_operators: false,
            channels: HashMap::new(),
            metrics_port: DEFAULT_METRICS_PORT,
            sync_interval: Duration::from_secs(600),
            deletion_sweep_interval: Duration::from_secs(10),
            grafana_url: DEFAULT_GRAFANA_URL.to_string(),
            grafana_auth: None,
            kubeconfig_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from `DBAAS_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup("DBAAS_VERSION_SERVICE_URL") {
            config.version_service_url = url.trim_end_matches('/').to_string();
        }
        if let Some(version) = lookup("DBAAS_PLATFORM_VERSION") {
            if version.trim().is_empty() {
                return Err(Error::config("DBAAS_PLATFORM_VERSION must not be empty"));
            }
            config.platform_version = version;
        }
        config.public_address = lookup("DBAAS_PUBLIC_ADDRESS").filter(|a| !a.is_empty());

        if let Some(value) = lookup("DBAAS_ALLOW_UNSUPPORTED_OPERATORS") {
            config.allow_unsupported_operators = parse_bool(&value).ok_or_else(|| {
                Error::config(format!(
                    "DBAAS_ALLOW_UNSUPPORTED_OPERATORS must be a boolean, got '{}'",
                    value
                ))
            })?;
        }

        for operator in OperatorId::SUBSCRIBED {
            let key = format!("DBAAS_{}_OPERATOR_CHANNEL", operator.env_key());
            if let Some(channel) = lookup(&key).filter(|c| !c.is_empty()) {
                config.channels.insert(operator, channel);
            }
        }

        if let Some(port) = lookup("DBAAS_METRICS_PORT") {
            config.metrics_port = port
                .parse()
                .map_err(|e| Error::config(format!("Invalid DBAAS_METRICS_PORT '{}': {}", port, e)))?;
        }
        if let Some(secs) = lookup("DBAAS_SYNC_INTERVAL_SECS") {
            config.sync_interval = parse_secs("DBAAS_SYNC_INTERVAL_SECS", &secs)?;
        }
        if let Some(secs) = lookup("DBAAS_DELETION_SWEEP_SECS") {
            config.deletion_sweep_interval = parse_secs("DBAAS_DELETION_SWEEP_SECS", &secs)?;
        }

        if let Some(url) = lookup("DBAAS_GRAFANA_URL").filter(|u| !u.is_empty()) {
            config.grafana_url = url.trim_end_matches('/').to_string();
        }
        config.grafana_auth = lookup("DBAAS_GRAFANA_AUTH").filter(|a| !a.is_empty());
        config.kubeconfig_dir = lookup("DBAAS_KUBECONFIG_DIR")
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        Ok(config)
    }

    /// OLM channel used for an operator, honouring overrides
    pub fn channel(&self, operator: OperatorId) -> &str {
        self.channels
            .get(&operator)
            .map(String::as_str)
            .unwrap_or_else(|| operator.default_channel())
    }

    /// Log the effective configuration
    pub fn log(&self) {
        info!(
            version_service = %self.version_service_url,
            platform_version = %self.platform_version,
            public_address = self.public_address.as_deref().unwrap_or("<unset>"),
            allow_unsupported_operators = self.allow_unsupported_operators,
            sync_interval = ?self.sync_interval,
            deletion_sweep_interval = ?self.deletion_sweep_interval,
            grafana = %self.grafana_url,
            kubeconfig_dir = ?self.kubeconfig_dir,
            "Loaded configuration"
        );
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .parse()
        .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, value, e)))?;
    if secs == 0 {
        return Err(Error::config(format!("{} must be greater than 0", key)));
    }
    Ok(Duration::from_secs(secs))
}

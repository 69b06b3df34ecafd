//! Operator bootstrap through the Operator Lifecycle Manager
//!
//! OLM itself is installed from embedded manifest bundles. Every other
//! operator is installed through a manually approved subscription.

mod bootstrap;
mod wait;

pub use bootstrap::{BootstrapState, OlmBootstrap, OLM_NAMESPACE};
pub use wait::{poll_until, PollSettings};

use std::fmt;
use std::str::FromStr;

use crate::crd::{Approval, Engine};
use crate::error::Error;

/// Catalog source carrying the database operators
pub const CATALOG_SOURCE: &str = "percona-dbaas-catalog";

/// Operator group created next to the subscriptions
pub const OPERATOR_GROUP: &str = "percona-operators-group";

/// Namespace the operators are installed into
pub const OPERATORS_NAMESPACE: &str = "default";

/// Operators the control plane knows how to install
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperatorId {
    /// The Operator Lifecycle Manager
    Olm,
    /// VictoriaMetrics operator running the monitoring agent
    VictoriaMetrics,
    /// Operator reconciling `DatabaseCluster` objects
    Dbaas,
    /// Percona XtraDB Cluster operator
    Pxc,
    /// Percona Server for MongoDB operator
    Psmdb,
}

impl OperatorId {
    /// Every operator, OLM first
    pub const ALL: [OperatorId; 5] = [
        OperatorId::Olm,
        OperatorId::VictoriaMetrics,
        OperatorId::Dbaas,
        OperatorId::Pxc,
        OperatorId::Psmdb,
    ];

    /// Operators installed through a subscription, in install order
    pub const SUBSCRIBED: [OperatorId; 4] = [
        OperatorId::Pxc,
        OperatorId::Psmdb,
        OperatorId::Dbaas,
        OperatorId::VictoriaMetrics,
    ];

    /// Short identifier used in result maps and logs
    pub fn key(&self) -> &'static str {
        match self {
            OperatorId::Olm => "olm",
            OperatorId::VictoriaMetrics => "vm",
            OperatorId::Dbaas => "dbaas",
            OperatorId::Pxc => "pxc",
            OperatorId::Psmdb => "psmdb",
        }
    }

    /// OLM package name, also the subscription and deployment name
    pub fn package(&self) -> &'static str {
        match self {
            OperatorId::Olm => "olm-operator",
            OperatorId::VictoriaMetrics => "victoriametrics-operator",
            OperatorId::Dbaas => "dbaas-operator",
            OperatorId::Pxc => "percona-xtradb-cluster-operator",
            OperatorId::Psmdb => "percona-server-mongodb-operator",
        }
    }

    /// Channel used when no override is configured
    pub fn default_channel(&self) -> &'static str {
        match self {
            OperatorId::Pxc | OperatorId::Psmdb => "stable-v1",
            _ => "stable-v0",
        }
    }

    /// Infix of the `DBAAS_<X>_OPERATOR_CHANNEL` variable
    pub fn env_key(&self) -> &'static str {
        match self {
            OperatorId::Olm => "OLM",
            OperatorId::VictoriaMetrics => "VM",
            OperatorId::Dbaas => "DBAAS",
            OperatorId::Pxc => "PXC",
            OperatorId::Psmdb => "PSMDB",
        }
    }

    /// Product name in the version matrix
    pub fn product(&self) -> Option<&'static str> {
        match self {
            OperatorId::Pxc => Some("pxc-operator"),
            OperatorId::Psmdb => Some("psmdb-operator"),
            _ => None,
        }
    }

    /// Operator managing the given engine
    pub fn for_engine(engine: Engine) -> Self {
        match engine {
            Engine::Pxc => OperatorId::Pxc,
            Engine::Psmdb => OperatorId::Psmdb,
        }
    }

    /// Engine managed by this operator
    pub fn engine(&self) -> Option<Engine> {
        match self {
            OperatorId::Pxc => Some(Engine::Pxc),
            OperatorId::Psmdb => Some(Engine::Psmdb),
            _ => None,
        }
    }

    /// Resolve a version matrix product name
    pub fn from_product(product: &str) -> Option<Self> {
        match product {
            "pxc-operator" => Some(OperatorId::Pxc),
            "psmdb-operator" => Some(OperatorId::Psmdb),
            _ => None,
        }
    }

    /// Resolve an OLM package name
    pub fn from_package(package: &str) -> Option<Self> {
        OperatorId::ALL.into_iter().find(|op| op.package() == package)
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for OperatorId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperatorId::ALL
            .into_iter()
            .find(|op| op.key() == s)
            .or_else(|| OperatorId::from_product(s))
            .ok_or_else(|| Error::invalid_argument(format!("{:?} is not a supported operator", s)))
    }
}

/// Everything needed to subscribe to one operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallRequest {
    pub namespace: String,
    pub name: String,
    pub operator_group: String,
    pub catalog_source: String,
    pub catalog_source_namespace: String,
    pub channel: String,
    pub approval: Approval,
    pub starting_csv: Option<String>,
}

impl InstallRequest {
    /// Manual-approval request for a known operator
    pub fn for_operator(operator: OperatorId, channel: impl Into<String>) -> Self {
        Self {
            namespace: OPERATORS_NAMESPACE.to_string(),
            name: operator.package().to_string(),
            operator_group: OPERATOR_GROUP.to_string(),
            catalog_source: CATALOG_SOURCE.to_string(),
            catalog_source_namespace: OLM_NAMESPACE.to_string(),
            channel: channel.into(),
            approval: Approval::Manual,
            starting_csv: None,
        }
    }
}

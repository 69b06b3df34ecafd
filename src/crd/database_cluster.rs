//! DatabaseCluster resource managed by the in-cluster dbaas operator

use std::fmt;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// DatabaseCluster specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "dbaas.percona.com",
    version = "v1",
    kind = "DatabaseCluster",
    plural = "databaseclusters",
    shortname = "db",
    namespaced,
    status = "DatabaseClusterStatus",
    printcolumn = r#"{"name": "Engine", "type": "string", "jsonPath": ".spec.databaseType"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterSpec {
    /// Database engine
    #[serde(rename = "databaseType")]
    pub database: Engine,

    /// Database image
    pub database_image: String,

    /// Engine configuration snippet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_config: Option<String>,

    /// Number of database nodes
    #[serde(default)]
    pub cluster_size: i32,

    /// Paused clusters keep their storage but run no pods
    #[serde(default)]
    pub pause: bool,
}

/// DatabaseCluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterStatus {
    /// Application state reported by the engine operator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<AppState>,

    /// Ready nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<i32>,

    /// Desired nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DatabaseCluster {
    /// True when the engine operator is tearing the cluster down
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
            || self.status.as_ref().and_then(|s| s.state) == Some(AppState::Deleting)
    }
}

/// Database engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Percona XtraDB Cluster
    Pxc,
    /// Percona Server for MongoDB
    Psmdb,
}

impl Engine {
    /// All engines the control plane can manage
    pub const ALL: [Engine; 2] = [Engine::Pxc, Engine::Psmdb];

    /// Lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Pxc => "pxc",
            Engine::Psmdb => "psmdb",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pxc" => Ok(Engine::Pxc),
            "psmdb" => Ok(Engine::Psmdb),
            other => Err(Error::invalid_argument(format!(
                "'{}' is not a supported database engine",
                other
            ))),
        }
    }
}

/// Application state of a database cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Initializing,
    Ready,
    Changing,
    Stopping,
    Paused,
    Deleting,
    Error,
    #[serde(other)]
    Unknown,
}

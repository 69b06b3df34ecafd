//! Version service document

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::olm::OperatorId;

/// One published version of a component
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersion {
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub image_hash: String,
    /// `recommended`, `available`, ...
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub critical: bool,
}

/// Component versions keyed by version string
pub type ComponentVersions = BTreeMap<String, ComponentVersion>;

/// Compatible component versions of one product version
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Matrix {
    pub mongod: ComponentVersions,
    pub pxc: ComponentVersions,
    pub pmm: ComponentVersions,
    pub proxysql: ComponentVersions,
    pub haproxy: ComponentVersions,
    pub backup: ComponentVersions,
    pub operator: ComponentVersions,
    pub log_collector: ComponentVersions,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pxc_operator: ComponentVersions,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub psmdb_operator: ComponentVersions,
}

impl Matrix {
    /// Operator versions a platform release supports
    pub fn operator_versions(&self, operator: OperatorId) -> Option<&ComponentVersions> {
        match operator {
            OperatorId::Pxc => Some(&self.pxc_operator),
            OperatorId::Psmdb => Some(&self.psmdb_operator),
            _ => None,
        }
    }

    /// Database versions an operator release can run
    pub fn database_versions(&self, operator: OperatorId) -> Option<&ComponentVersions> {
        match operator {
            OperatorId::Pxc => Some(&self.pxc),
            OperatorId::Psmdb => Some(&self.mongod),
            _ => None,
        }
    }
}

/// One product version and its matrix
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VersionEntry {
    #[serde(default)]
    pub product: String,
    /// Version of the product the matrix belongs to
    #[serde(rename = "operator", default)]
    pub product_version: String,
    #[serde(default)]
    pub matrix: Matrix,
}

/// Body of a version service response
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VersionResponse {
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

/// Filter of a matrix request
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MatrixParams {
    pub product: String,
    pub product_version: Option<String>,
    pub db_version: Option<String>,
}

impl MatrixParams {
    pub fn new(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            product_version: None,
            db_version: None,
        }
    }

    /// Narrow to one product version; empty strings are ignored
    pub fn with_product_version(mut self, version: impl Into<String>) -> Self {
        self.product_version = Some(version.into()).filter(|v: &String| !v.is_empty());
        self
    }

    /// Narrow to one database version; empty strings are ignored
    pub fn with_db_version(mut self, version: impl Into<String>) -> Self {
        self.db_version = Some(version.into()).filter(|v: &String| !v.is_empty());
        self
    }

    /// `<base>/<product>[/<productVersion>[/<dbVersion>]]`
    ///
    /// The database version only narrows a request that names a product
    /// version.
    pub fn url(&self, base: &str) -> String {
        let mut url = format!("{}/{}", base.trim_end_matches('/'), self.product);
        if let Some(product_version) = &self.product_version {
            url.push('/');
            url.push_str(product_version);
            if let Some(db_version) = &self.db_version {
                url.push('/');
                url.push_str(db_version);
            }
        }
        url
    }
}

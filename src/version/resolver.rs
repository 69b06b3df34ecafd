//! Version resolver capability

use std::collections::HashMap;

use super::components::{latest_recommended, next};
use super::matrix::{MatrixParams, VersionResponse};
use super::core_version;
use crate::error::{Error, Result};
use crate::olm::OperatorId;

/// Product describing the monitoring platform in the version service
pub const PLATFORM_PRODUCT: &str = "pmm-server";

/// Latest recommended database operators for a platform release
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LatestOperatorVersions {
    pub pxc: Option<String>,
    pub psmdb: Option<String>,
}

impl LatestOperatorVersions {
    pub fn get(&self, operator: OperatorId) -> Option<&str> {
        match operator {
            OperatorId::Pxc => self.pxc.as_deref(),
            OperatorId::Psmdb => self.psmdb.as_deref(),
            _ => None,
        }
    }
}

fn product(operator: OperatorId) -> Result<&'static str> {
    operator
        .product()
        .ok_or_else(|| Error::invalid_argument(format!("{:?} is an unknown operator type", operator.key())))
}

/// Access to the version matrix.
///
/// Implementors provide [`matrix`](VersionResolver::matrix); the queries
/// built on top of it are shared.
#[async_trait::async_trait]
pub trait VersionResolver: Send + Sync {
    /// Matrix entries matching `params`
    async fn matrix(&self, params: &MatrixParams) -> Result<VersionResponse>;

    /// Scheme and host of the service
    fn version_service_url(&self) -> String;

    /// True when the matrix of `operator_version` lists `db_version`
    async fn is_database_version_supported_by_operator(
        &self,
        operator: OperatorId,
        operator_version: &str,
        db_version: &str,
    ) -> Result<bool> {
        let params = MatrixParams::new(product(operator)?)
            .with_product_version(operator_version)
            .with_db_version(db_version);
        Ok(!self.matrix(&params).await?.versions.is_empty())
    }

    /// Operator versions published for the core of `platform_version`
    async fn supported_operator_versions_list(
        &self,
        platform_version: &str,
    ) -> Result<HashMap<OperatorId, Vec<String>>> {
        let params = MatrixParams::new(PLATFORM_PRODUCT).with_product_version(core_version(platform_version)?);
        let response = self.matrix(&params).await?;

        let mut supported = HashMap::new();
        let Some(entry) = response.versions.first() else {
            return Ok(supported);
        };
        for operator in [OperatorId::Pxc, OperatorId::Psmdb] {
            let versions = entry
                .matrix
                .operator_versions(operator)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            supported.insert(operator, versions);
        }
        Ok(supported)
    }

    /// True when `operator_version` is published for `platform_version`
    async fn is_operator_version_supported(
        &self,
        operator: OperatorId,
        platform_version: &str,
        operator_version: &str,
    ) -> Result<bool> {
        product(operator)?;
        let supported = self.supported_operator_versions_list(platform_version).await?;
        Ok(supported
            .get(&operator)
            .map_or(false, |versions| versions.iter().any(|v| v == operator_version)))
    }

    /// Latest recommended pxc and psmdb operators for a platform release.
    ///
    /// `None` when the service does not have exactly one entry for it.
    async fn latest_operator_version(
        &self,
        platform_version: &str,
    ) -> Result<Option<LatestOperatorVersions>> {
        if platform_version.is_empty() {
            return Err(Error::invalid_argument("given platform version is empty"));
        }
        let params = MatrixParams::new(PLATFORM_PRODUCT).with_product_version(platform_version);
        let response = self.matrix(&params).await?;
        let [entry] = response.versions.as_slice() else {
            return Ok(None);
        };

        Ok(Some(LatestOperatorVersions {
            pxc: latest_recommended(&entry.matrix.pxc_operator)?,
            psmdb: latest_recommended(&entry.matrix.psmdb_operator)?,
        }))
    }

    /// Image of the database version directly after `installed_db_version`
    /// for the given operator release
    async fn next_database_image(
        &self,
        operator: OperatorId,
        operator_version: &str,
        installed_db_version: &str,
    ) -> Result<Option<String>> {
        let params = MatrixParams::new(product(operator)?).with_product_version(operator_version);
        let response = self.matrix(&params).await?;
        let [entry] = response.versions.as_slice() else {
            return Ok(None);
        };
        let Some(versions) = entry.matrix.database_versions(operator) else {
            return Ok(None);
        };

        let available: Vec<&str> = versions.keys().map(String::as_str).collect();
        let Some(successor) = next(&available, installed_db_version)? else {
            return Ok(None);
        };
        Ok(versions.get(&successor).map(|c| c.image_path.clone()))
    }

    /// Operator release directly after `installed`, regardless of platform
    /// support. Upgrades have to go one release at a time.
    async fn next_operator_version(
        &self,
        operator: OperatorId,
        installed: &str,
    ) -> Result<Option<String>> {
        if installed.is_empty() {
            return Ok(None);
        }
        let response = self.matrix(&MatrixParams::new(product(operator)?)).await?;
        let available: Vec<&str> = response
            .versions
            .iter()
            .map(|v| v.product_version.as_str())
            .collect();
        next(&available, installed)
    }
}

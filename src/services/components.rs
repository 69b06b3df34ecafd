//! Component versions offered for database clusters and operator upgrades

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use lazy_static::lazy_static;
use regex::Regex;
use semver::Version;
use tracing::{debug, info, instrument, warn};

use super::{Context, OperatorStatus};
use crate::adapters::check_connection;
use crate::crd::Engine;
use crate::error::{Error, Result};
use crate::olm::{OperatorId, OPERATORS_NAMESPACE};
use crate::store::{ClusterRegistration, ComponentOverrides};
use crate::version::{select, set_component, ChangeComponent, ComponentSelection, MatrixParams};

lazy_static! {
    /// Version suffix of a CSV name, `percona-server-mongodb-operator.v1.12.0`
    static ref CSV_VERSION: Regex = Regex::new(r"v(\d+\.\d+\.\d+)$").unwrap();

    static ref MONGOD_MINIMUM: Version = Version::new(4, 2, 0);
    static ref PXC_MINIMUM: Version = Version::new(8, 0, 0);
}

/// Components whose default and disabled versions can be overridden
const OVERRIDABLE: [&str; 4] = ["mongod", "pxc", "proxysql", "haproxy"];

/// Selections of one operator release keyed by component name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatorComponents {
    pub product: String,
    pub operator_version: String,
    pub matrix: BTreeMap<String, ComponentSelection>,
}

/// Component catalogue and operator upgrade service
#[derive(Clone)]
pub struct ComponentsService {
    ctx: Arc<Context>,
}

impl ComponentsService {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Component versions for an engine.
    ///
    /// With a cluster, the matrix of its installed operator is used and the
    /// cluster's overrides are applied.
    pub async fn get_components(
        &self,
        engine: Engine,
        cluster: Option<&str>,
        db_version: Option<&str>,
    ) -> Result<Vec<OperatorComponents>> {
        let operator = OperatorId::for_engine(engine);
        let product = operator
            .product()
            .ok_or_else(|| Error::internal(format!("no product for operator {}", operator)))?;
        let mut params = MatrixParams::new(product).with_db_version(db_version.unwrap_or_default());

        let mut overrides = ComponentOverrides::new();
        if let Some(name) = cluster.filter(|n| !n.is_empty()) {
            let registration = self.ctx.store.find_cluster(name).await?;
            let client = self.ctx.client(name).await?;
            let connection = check_connection(client.as_ref()).await?;
            if let Some(version) = connection.operator_version(operator) {
                params = params.with_product_version(version);
            }
            overrides = registration.components;
        }

        let response = self.ctx.versions.matrix(&params).await?;
        Ok(response
            .versions
            .iter()
            .map(|entry| {
                let m = &entry.matrix;
                let mut matrix = BTreeMap::new();
                for (component, versions, minimum) in [
                    ("mongod", &m.mongod, Some(&*MONGOD_MINIMUM)),
                    ("pxc", &m.pxc, Some(&*PXC_MINIMUM)),
                    ("pmm", &m.pmm, None),
                    ("proxysql", &m.proxysql, None),
                    ("haproxy", &m.haproxy, None),
                    ("backup", &m.backup, None),
                    ("operator", &m.operator, None),
                    ("logCollector", &m.log_collector, None),
                ] {
                    let component_override = overrides
                        .get(component)
                        .filter(|_| OVERRIDABLE.contains(&component));
                    matrix.insert(
                        component.to_string(),
                        select(versions, minimum, component_override),
                    );
                }
                OperatorComponents {
                    product: entry.product.clone(),
                    operator_version: entry.product_version.clone(),
                    matrix,
                }
            })
            .collect())
    }

    /// Update the stored overrides of a cluster.
    ///
    /// All changes are validated first; nothing is stored when any of them
    /// is rejected.
    #[instrument(skip(self, changes))]
    pub async fn change_components(
        &self,
        cluster: &str,
        changes: BTreeMap<String, ChangeComponent>,
    ) -> Result<()> {
        for component in changes.keys() {
            if !OVERRIDABLE.contains(&component.as_str()) {
                return Err(Error::invalid_argument(format!(
                    "component {:?} can't be changed, cluster: {}",
                    component, cluster
                )));
            }
        }

        let name = cluster.to_string();
        self.ctx
            .store
            .update_components(
                cluster,
                Box::new(move |components: &mut ComponentOverrides| {
                    for (component, change) in &changes {
                        let updated = set_component(components.get(component), change).map_err(|e| {
                            Error::invalid_argument(format!(
                                "{}, cluster: {}, component: {}",
                                e, name, component
                            ))
                        })?;
                        components.insert(component.clone(), updated);
                    }
                    Ok(())
                }),
            )
            .await?;

        info!("Components updated");
        Ok(())
    }

    /// Available operator upgrades per cluster.
    ///
    /// A subscription whose channel head differs from the installed CSV
    /// reports the head's version. Clusters that can not be queried are left
    /// out.
    pub async fn check_for_operator_update(
        &self,
    ) -> Result<HashMap<String, HashMap<OperatorId, String>>> {
        let registrations = self.ctx.store.list_clusters().await?;
        let checks = registrations.iter().map(|r| self.pending_updates(r));

        Ok(join_all(checks)
            .await
            .into_iter()
            .flatten()
            .collect())
    }

    async fn pending_updates(
        &self,
        registration: &ClusterRegistration,
    ) -> Option<(String, HashMap<OperatorId, String>)> {
        let subscriptions = match self.ctx.client(&registration.name).await {
            Ok(client) => client.list_subscriptions(OPERATORS_NAMESPACE).await,
            Err(e) => Err(e),
        };
        let subscriptions = match subscriptions {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                debug!(cluster = %registration.name, error = %e, "Cannot list subscriptions");
                return None;
            }
        };

        let mut updates = HashMap::new();
        for subscription in subscriptions.iter().filter(|s| s.has_pending_upgrade()) {
            let Some(operator) = OperatorId::from_package(&subscription.spec.name) else {
                continue;
            };
            if operator.engine().is_none() {
                continue;
            }
            let available = subscription
                .status
                .as_ref()
                .and_then(|s| s.current_csv.as_deref())
                .and_then(|csv| CSV_VERSION.captures(csv))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string());
            if let Some(version) = available {
                updates.insert(operator, version);
            }
        }
        Some((registration.name.clone(), updates))
    }

    /// Approve the pending upgrade of a database operator.
    ///
    /// The cluster's default database version has to be supported by the
    /// target operator release.
    #[instrument(skip(self))]
    pub async fn install_operator(
        &self,
        cluster: &str,
        operator: OperatorId,
        version: &str,
    ) -> Result<OperatorStatus> {
        let engine = operator
            .engine()
            .ok_or_else(|| Error::invalid_argument(format!("{:?} is not supported operator", operator.key())))?;
        let registration = self.ctx.store.find_cluster(cluster).await?;

        let component = match engine {
            Engine::Pxc => "pxc",
            Engine::Psmdb => "mongod",
        };
        if let Some(default) = registration.default_version(component) {
            let supported = self
                .ctx
                .versions
                .is_database_version_supported_by_operator(operator, version, default)
                .await?;
            if !supported {
                return Err(Error::precondition(format!(
                    "default database version {} is unsupported by the operator version {}, please change default version.",
                    default, version
                )));
            }
        }

        let client = self.ctx.client(cluster).await?;
        let approved = self
            .ctx
            .bootstrap(client)
            .upgrade_operator(OPERATORS_NAMESPACE, operator.package())
            .await?;
        if approved {
            info!(version = %version, "Operator upgrade approved");
        } else {
            warn!(version = %version, "No pending operator upgrade");
        }
        Ok(OperatorStatus::Ok)
    }
}

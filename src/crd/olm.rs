//! Operator Lifecycle Manager resources
//!
//! Only the fields the bootstrap workflow reads or writes are modelled;
//! everything else OLM stores on these objects is ignored on decode.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by all OLM resources
pub const OLM_GROUP: &str = "operators.coreos.com";

/// Install plan approval mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Approval {
    /// OLM applies install plans without asking
    Automatic,
    /// Install plans wait until `spec.approved` is set
    #[default]
    Manual,
}

/// Subscription specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "Subscription",
    plural = "subscriptions",
    namespaced,
    status = "SubscriptionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// Catalog source name
    pub source: String,

    /// Namespace of the catalog source
    pub source_namespace: String,

    /// Package name inside the catalog
    pub name: String,

    /// Update channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// First CSV to install
    #[serde(rename = "startingCSV", skip_serializing_if = "Option::is_none")]
    pub starting_csv: Option<String>,

    /// Install plan approval mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_plan_approval: Option<Approval>,
}

/// Subscription status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    /// Reference to the install plan generated for the subscription
    #[serde(rename = "installplan", skip_serializing_if = "Option::is_none")]
    pub install_plan: Option<InstallPlanReference>,

    /// Latest CSV available in the channel
    #[serde(rename = "currentCSV", skip_serializing_if = "Option::is_none")]
    pub current_csv: Option<String>,

    /// CSV currently installed
    #[serde(rename = "installedCSV", skip_serializing_if = "Option::is_none")]
    pub installed_csv: Option<String>,

    /// Subscription state (AtLatestKnown, UpgradePending, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Install plan reference inside a subscription status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl Subscription {
    /// Name of the install plan OLM created, if any
    pub fn install_plan_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.install_plan.as_ref())
            .map(|ip| ip.name.as_str())
            .filter(|name| !name.is_empty())
    }

    /// True when the channel head differs from what is installed
    pub fn has_pending_upgrade(&self) -> bool {
        match &self.status {
            Some(status) => match (&status.current_csv, &status.installed_csv) {
                (Some(current), Some(installed)) => current != installed,
                _ => false,
            },
            None => false,
        }
    }
}

/// Install plan specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "InstallPlan",
    plural = "installplans",
    namespaced,
    status = "InstallPlanStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanSpec {
    /// CSVs this plan installs
    #[serde(default)]
    pub cluster_service_version_names: Vec<String>,

    /// Approval mode
    #[serde(default)]
    pub approval: Approval,

    /// Whether the plan may be executed
    #[serde(default)]
    pub approved: bool,

    /// Plan generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
}

/// Install plan status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanStatus {
    /// Plan phase (RequiresApproval, Installing, Complete, Failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Operator group specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operators.coreos.com",
    version = "v1",
    kind = "OperatorGroup",
    plural = "operatorgroups",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorGroupSpec {
    /// Namespaces watched by operators of this group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_namespaces: Vec<String>,
}

/// Cluster service version specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "ClusterServiceVersion",
    plural = "clusterserviceversions",
    shortname = "csv",
    namespaced,
    status = "ClusterServiceVersionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Cluster service version status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionStatus {
    /// Install phase (Pending, Installing, Succeeded, Failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClusterServiceVersion {
    /// True once OLM finished installing the operator
    pub fn succeeded(&self) -> bool {
        self.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Succeeded")
    }

    /// True when OLM gave up on the install
    pub fn failed(&self) -> bool {
        self.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscription_status_decodes_olm_field_names() {
        let sub: Subscription = serde_json::from_value(json!({
            "apiVersion": "operators.coreos.com/v1alpha1",
            "kind": "Subscription",
            "metadata": { "name": "percona-xtradb-cluster-operator", "namespace": "default" },
            "spec": {
                "source": "percona-dbaas-catalog",
                "sourceNamespace": "olm",
                "name": "percona-xtradb-cluster-operator",
                "channel": "stable-v1",
                "installPlanApproval": "Manual"
            },
            "status": {
                "installplan": { "apiVersion": "operators.coreos.com/v1alpha1", "kind": "InstallPlan", "name": "install-abcde" },
                "currentCSV": "percona-xtradb-cluster-operator.v1.12.0",
                "installedCSV": "percona-xtradb-cluster-operator.v1.11.0"
            }
        }))
        .unwrap();

        assert_eq!(sub.install_plan_name(), Some("install-abcde"));
        assert!(sub.has_pending_upgrade());
        assert_eq!(sub.spec.install_plan_approval, Some(Approval::Manual));
    }

    #[test]
    fn test_subscription_without_status_has_no_plan() {
        let sub = Subscription::new("dbaas-operator", SubscriptionSpec::default());
        assert_eq!(sub.install_plan_name(), None);
        assert!(!sub.has_pending_upgrade());
    }
}

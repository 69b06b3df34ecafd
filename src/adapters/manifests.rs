//! Multi-document manifest decoding for server-side apply

use kube::discovery::ApiResource;
use serde::Deserialize;

use crate::error::{Error, Result};

/// One decoded manifest document
#[derive(Clone, Debug)]
pub struct Manifest {
    /// Raw object as sent to the API server
    pub value: serde_json::Value,
    /// Object name
    pub name: String,
    /// Namespace for namespaced objects
    pub namespace: Option<String>,
    /// Resource the object belongs to
    pub api_resource: ApiResource,
}

impl Manifest {
    /// Decode a single object
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let api_version = value
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid_argument("Manifest missing apiVersion"))?
            .to_string();

        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid_argument("Manifest missing kind"))?
            .to_string();

        let name = value
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid_argument(format!("{} manifest missing metadata.name", kind)))?
            .to_string();

        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let (group, version) = parse_api_version(&api_version);
        let plural = pluralize(&kind);

        Ok(Self {
            value,
            name,
            namespace,
            api_resource: ApiResource {
                group,
                version,
                kind,
                api_version,
                plural,
            },
        })
    }

    /// Object kind
    pub fn kind(&self) -> &str {
        &self.api_resource.kind
    }

    /// True for `operators.coreos.com` subscriptions
    pub fn is_subscription(&self) -> bool {
        self.api_resource.group == crate::crd::OLM_GROUP && self.api_resource.kind == "Subscription"
    }
}

/// Decode a YAML stream with any number of `---` separated documents.
///
/// Empty documents (comments only, trailing separators) are skipped.
pub fn parse_documents(yaml: &str) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();

    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_json::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        manifests.push(Manifest::from_value(value)?);
    }

    Ok(manifests)
}

/// Subscriptions contained in a set of manifests, as (namespace, name)
pub fn subscriptions(manifests: &[Manifest]) -> Vec<(String, String)> {
    manifests
        .iter()
        .filter(|m| m.is_subscription())
        .map(|m| {
            (
                m.namespace.clone().unwrap_or_else(|| "default".to_string()),
                m.name.clone(),
            )
        })
        .collect()
}

fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Simple pluralization for Kubernetes resource kinds
fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

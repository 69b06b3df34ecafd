//! Monitoring agent inside registered clusters
//!
//! Every registered cluster runs a VictoriaMetrics agent that pushes metrics
//! back to the platform. The agent authenticates with an API key minted
//! through [`MonitoringCredentials`].

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::adapters::{KubernetesClient, Manifest};
use crate::error::{Error, Result};
use crate::olm::OPERATORS_NAMESPACE;

/// Secret holding the agent's remote-write credentials
pub const CREDENTIALS_SECRET: &str = "dbaas-vmagent-credentials";

/// Name of the agent object
pub const VMAGENT_NAME: &str = "pmm-vmagent";

/// Login the platform expects for API key authentication
const API_KEY_LOGIN: &str = "api_key";

/// A minted API key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiKey {
    pub id: i64,
    pub key: String,
}

/// Mints and revokes monitoring API keys
#[async_trait::async_trait]
pub trait MonitoringCredentials: Send + Sync {
    /// Create an admin API key with the given name
    async fn create_api_key(&self, name: &str) -> Result<ApiKey>;

    async fn delete_api_key(&self, id: i64) -> Result<()>;
}

#[derive(Serialize)]
struct CreateKeyRequest<'a> {
    name: &'a str,
    role: &'a str,
}

#[derive(Deserialize)]
struct CreateKeyResponse {
    id: i64,
    key: String,
}

/// [`MonitoringCredentials`] backed by the Grafana HTTP API
pub struct GrafanaCredentials {
    client: Client,
    base_url: String,
    authorization: Option<String>,
}

impl GrafanaCredentials {
    /// `authorization` is sent verbatim as the `Authorization` header
    pub fn new(base_url: impl Into<String>, authorization: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            authorization,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Accept", "application/json");
        match &self.authorization {
            Some(auth) => builder.header("Authorization", auth),
            None => builder,
        }
    }
}

#[async_trait::async_trait]
impl MonitoringCredentials for GrafanaCredentials {
    async fn create_api_key(&self, name: &str) -> Result<ApiKey> {
        let response = self
            .request(reqwest::Method::POST, "/api/auth/keys")
            .json(&CreateKeyRequest { name, role: "Admin" })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::internal(format!(
                "cannot create API key {}: {} - {}",
                name, status, body
            )));
        }

        let created: CreateKeyResponse = serde_json::from_str(&response.text().await?)?;
        debug!(name = %name, id = created.id, "Created API key");
        Ok(ApiKey {
            id: created.id,
            key: created.key,
        })
    }

    async fn delete_api_key(&self, id: i64) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/api/auth/keys/{}", id))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::internal(format!(
                "cannot delete API key {}: {} - {}",
                id, status, body
            )));
        }
        Ok(())
    }
}

/// Objects making up the monitoring agent
pub fn monitoring_manifests(public_address: &str, api_key: &str) -> Result<Vec<Manifest>> {
    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": CREDENTIALS_SECRET,
            "namespace": OPERATORS_NAMESPACE,
        },
        "type": "Opaque",
        "stringData": {
            "username": API_KEY_LOGIN,
            "password": api_key,
        },
    });

    let agent = json!({
        "apiVersion": "operator.victoriametrics.com/v1beta1",
        "kind": "VMAgent",
        "metadata": {
            "name": VMAGENT_NAME,
            "namespace": OPERATORS_NAMESPACE,
        },
        "spec": {
            "selectAllByDefault": true,
            "serviceScrapeNamespaceSelector": {},
            "podScrapeNamespaceSelector": {},
            "extraArgs": {
                "memory.allowedPercent": "40",
            },
            "remoteWrite": [{
                "url": format!("https://{}/victoriametrics/api/v1/write", public_address),
                "basicAuth": {
                    "username": { "name": CREDENTIALS_SECRET, "key": "username" },
                    "password": { "name": CREDENTIALS_SECRET, "key": "password" },
                },
                "tlsConfig": { "insecureSkipVerify": true },
            }],
        },
    });

    Ok(vec![Manifest::from_value(secret)?, Manifest::from_value(agent)?])
}

/// Deploy the agent and its credentials
pub async fn start_monitoring(
    client: &dyn KubernetesClient,
    public_address: &str,
    api_key: &str,
) -> Result<()> {
    for manifest in monitoring_manifests(public_address, api_key)? {
        client.apply(&manifest).await?;
    }
    info!(public_address = %public_address, "Monitoring agent started");
    Ok(())
}

/// Remove the agent and its credentials; absent objects are fine
pub async fn stop_monitoring(client: &dyn KubernetesClient) -> Result<()> {
    for manifest in monitoring_manifests("", "")?.iter().rev() {
        client.delete(manifest).await?;
    }
    info!("Monitoring agent stopped");
    Ok(())
}

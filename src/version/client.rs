//! HTTP client for the version service

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::matrix::{MatrixParams, VersionResponse};
use super::resolver::VersionResolver;
use crate::error::{Error, Result};
use crate::metrics::VERSION_SERVICE_REQUESTS;

/// How long a fetched matrix is served from cache
pub const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

struct CachedResponse {
    fetched_at: Instant,
    response: VersionResponse,
}

/// Version service client with a per-URL response cache
pub struct VersionServiceClient {
    client: Client,
    base_url: String,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedResponse>>,
}

impl VersionServiceClient {
    /// Create a client for the given base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ttl: CACHE_TTL,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Override the cache freshness window
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn cached(&self, url: &str) -> Option<VersionResponse> {
        let cache = self.cache.lock().await;
        cache
            .get(url)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.response.clone())
    }

    async fn fetch(&self, url: &str) -> Result<VersionResponse> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::internal(format!(
                "version service returned {} for {}: {}",
                status, url, body
            )));
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait::async_trait]
impl VersionResolver for VersionServiceClient {
    async fn matrix(&self, params: &MatrixParams) -> Result<VersionResponse> {
        let url = params.url(&self.base_url);

        if let Some(response) = self.cached(&url).await {
            VERSION_SERVICE_REQUESTS.with_label_values(&["hit"]).inc();
            return Ok(response);
        }

        // The lock is not held across the request; concurrent misses for the
        // same URL each fetch and the last one wins.
        VERSION_SERVICE_REQUESTS.with_label_values(&["miss"]).inc();
        let response = match self.fetch(&url).await {
            Ok(response) => response,
            Err(e) => {
                VERSION_SERVICE_REQUESTS.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };
        debug!(url = %url, versions = response.versions.len(), "Fetched version matrix");

        self.cache.lock().await.insert(
            url,
            CachedResponse {
                fetched_at: Instant::now(),
                response: response.clone(),
            },
        );
        Ok(response)
    }

    fn version_service_url(&self) -> String {
        match url::Url::parse(&self.base_url) {
            Ok(parsed) => {
                let host = parsed.host_str().unwrap_or_default();
                match parsed.port() {
                    Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
                    None => format!("{}://{}", parsed.scheme(), host),
                }
            }
            Err(e) => {
                warn!(url = %self.base_url, error = %e, "Failed to parse version service URL");
                self.base_url.clone()
            }
        }
    }
}

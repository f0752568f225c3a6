use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::protocol::{HEALTH_PATH, SERVER_HEALTH_PATH};
use shared::types::{Address, HealthResponse};

/// The two identity checks run against every tracked address.
///
/// `None` means the probe failed, for whatever reason.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// Robot API identity
    async fn device_health(&self, address: &Address) -> Option<HealthResponse>;

    /// Update server identity, served by a separate process on the same host
    async fn server_health(&self, address: &Address) -> Option<HealthResponse>;
}

/// Probes over plain HTTP
pub struct HttpProbe {
    http: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }

    async fn fetch(&self, address: &Address, path: &str) -> Option<HealthResponse> {
        let url = format!("{}{}", address.base_url(), path);

        let resp = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("GET {} failed: {}", url, e);
                return None;
            }
        };

        if !resp.status().is_success() {
            tracing::debug!("GET {} returned {}", url, resp.status());
            return None;
        }

        match resp.json::<HealthResponse>().await {
            Ok(health) => Some(health),
            Err(e) => {
                tracing::debug!("GET {} returned an unusable body: {}", url, e);
                None
            }
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn device_health(&self, address: &Address) -> Option<HealthResponse> {
        self.fetch(address, HEALTH_PATH).await
    }

    async fn server_health(&self, address: &Address) -> Option<HealthResponse> {
        self.fetch(address, SERVER_HEALTH_PATH).await
    }
}

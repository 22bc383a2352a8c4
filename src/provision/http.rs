//! HTTP client for the daemon provisioning service.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::error::ProvisionError;
use crate::provision::{DaemonStatus, ProvisionTicket, ProvisioningClient};

/// Per-request timeout; the lease client's own deadline bounds the overall
/// provisioning wait.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Provisioning client over the service's JSON API.
pub struct HttpProvisioningClient {
    client: Client,
    base_url: String,
}

impl HttpProvisioningClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProvisionError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProvisionError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn daemons_url(&self) -> String {
        format!("{}/v1/daemons", self.base_url)
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioningClient {
    async fn provision(&self, run_id: &str) -> Result<ProvisionTicket, ProvisionError> {
        let resp = self
            .client
            .post(self.daemons_url())
            .json(&serde_json::json!({ "run_id": run_id }))
            .send()
            .await
            .map_err(|e| ProvisionError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Transport(format!(
                "provision returned {}: {}",
                status, body
            )));
        }

        resp.json::<ProvisionTicket>()
            .await
            .map_err(|e| ProvisionError::Transport(e.to_string()))
    }

    async fn get_status(&self, request_id: &str) -> Result<DaemonStatus, ProvisionError> {
        let resp = self
            .client
            .get(format!("{}/{}", self.daemons_url(), request_id))
            .send()
            .await
            .map_err(|e| ProvisionError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Transport(format!(
                "status poll returned {}: {}",
                status, body
            )));
        }

        resp.json::<DaemonStatus>()
            .await
            .map_err(|e| ProvisionError::Transport(e.to_string()))
    }

    async fn deprovision(&self, request_id: &str) -> Result<(), ProvisionError> {
        let resp = self
            .client
            .delete(format!("{}/{}", self.daemons_url(), request_id))
            .send()
            .await
            .map_err(|e| ProvisionError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Transport(format!(
                "deprovision returned {}: {}",
                status, body
            )));
        }

        Ok(())
    }
}

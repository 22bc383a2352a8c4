//! Image registry collaborator.
//!
//! Exchanges registry credentials for a bearer token, lists the tags of the
//! runner image repository, and selects the most recently published tag.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::error::RegistryError;

/// Environment variable holding the registry user name.
pub const REGISTRY_USER_ENV: &str = "RUNNER_REGISTRY_USER";

/// Environment variable holding the registry password.
pub const REGISTRY_PASSWORD_ENV: &str = "RUNNER_REGISTRY_PASSWORD";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
}

/// One tag entry from the registry listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteImage {
    pub tag: String,
    #[serde(default)]
    pub digest: String,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
struct TagListing {
    #[serde(default)]
    imgs: Vec<RemoteImage>,
}

/// The newest published runner image.
#[derive(Debug, Clone)]
pub struct LatestImage {
    pub reference: String,
    pub created: DateTime<Utc>,
}

/// Parameters for the registry client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry API base URL.
    pub base_url: String,
    /// Repository path of the runner image.
    pub repository: String,
    pub username: String,
    pub password: String,
}

/// Client for the image registry's token and tag-listing endpoints.
pub struct RegistryClient {
    client: Client,
    config: RegistryConfig,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        if config.username.is_empty() || config.password.is_empty() {
            return Err(RegistryError::MissingCredentials);
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(RegistryError::Http)?;

        Ok(Self { client, config })
    }

    /// Builds a client with credentials read from the environment.
    pub fn from_env(
        base_url: impl Into<String>,
        repository: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let username = std::env::var(REGISTRY_USER_ENV).unwrap_or_default();
        let password = std::env::var(REGISTRY_PASSWORD_ENV).unwrap_or_default();
        Self::new(RegistryConfig {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            repository: repository.into(),
            username,
            password,
        })
    }

    /// Exchanges the configured credentials for a bearer token.
    pub async fn bearer_token(&self) -> Result<String, RegistryError> {
        let auth = BASE64.encode(format!(
            "{}:{}",
            self.config.username, self.config.password
        ));

        let resp = self
            .client
            .get(format!("{}/token", self.config.base_url))
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", auth))
            .send()
            .await?
            .error_for_status()?;

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        if token.token.is_empty() {
            return Err(RegistryError::Decode(
                "token endpoint returned an empty token".to_string(),
            ));
        }
        Ok(token.token)
    }

    /// Returns the most recently published tag of the runner repository.
    pub async fn latest_image(&self) -> Result<LatestImage, RegistryError> {
        let token = self.bearer_token().await?;

        let resp = self
            .client
            .get(format!(
                "{}/images/{}",
                self.config.base_url, self.config.repository
            ))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?;

        let listing: TagListing = resp
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        newest_tag(&listing.imgs)
            .map(|(image, created)| LatestImage {
                reference: format!("{}:{}", self.config.repository, image.tag),
                created,
            })
            .ok_or_else(|| RegistryError::NoMatchingTag(self.config.repository.clone()))
    }
}

/// Picks the entry with the most recent RFC 3339 timestamp. Entries with
/// unparseable timestamps are skipped.
fn newest_tag(imgs: &[RemoteImage]) -> Option<(&RemoteImage, DateTime<Utc>)> {
    let mut newest: Option<(&RemoteImage, DateTime<Utc>)> = None;
    for image in imgs {
        let created = match DateTime::parse_from_rfc3339(&image.timestamp) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => {
                warn!(tag = %image.tag, error = %e, "skipping tag with bad timestamp");
                continue;
            }
        };
        match &newest {
            Some((_, ts)) if *ts >= created => {}
            _ => newest = Some((image, created)),
        }
    }
    newest
}

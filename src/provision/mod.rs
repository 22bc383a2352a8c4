//! Remote daemon provisioning service boundary.
//!
//! The lease client drives the provisioning service through the
//! [`ProvisioningClient`] trait; the reqwest-backed implementation lives in
//! [`http`].

mod http;

pub use http::HttpProvisioningClient;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ProvisionError;

/// Response to a provisioning request.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionTicket {
    /// Service-assigned request ID, used for status polls and teardown.
    #[serde(rename = "id")]
    pub request_id: String,
}

/// One status poll result.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    /// Daemon URI; populated once the state is `provisioned`.
    #[serde(default)]
    pub url: String,
}

/// Provisioning state reported by the service.
///
/// States the service may add later decode as `Unknown` and are treated as
/// still-in-progress by the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Pending,
    Provisioned,
    Error,
    Unknown,
}

impl DaemonState {
    /// Parses the service's state string.
    pub fn parse(state: &str) -> Self {
        match state {
            "pending" => DaemonState::Pending,
            "provisioned" => DaemonState::Provisioned,
            "error" => DaemonState::Error,
            _ => DaemonState::Unknown,
        }
    }
}

impl<'de> serde::Deserialize<'de> for DaemonState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let state = String::deserialize(deserializer)?;
        Ok(DaemonState::parse(&state))
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonState::Pending => write!(f, "pending"),
            DaemonState::Provisioned => write!(f, "provisioned"),
            DaemonState::Error => write!(f, "error"),
            DaemonState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Client for the daemon provisioning service.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    /// Requests a new daemon for the given run.
    async fn provision(&self, run_id: &str) -> Result<ProvisionTicket, ProvisionError>;

    /// Polls the state of an outstanding request.
    async fn get_status(&self, request_id: &str) -> Result<DaemonStatus, ProvisionError>;

    /// Releases a previously provisioned daemon.
    async fn deprovision(&self, request_id: &str) -> Result<(), ProvisionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_state_decode() {
        let status: DaemonStatus =
            serde_json::from_str(r#"{"state":"pending"}"#).expect("decode");
        assert_eq!(status.state, DaemonState::Pending);
        assert!(status.url.is_empty());

        let status: DaemonStatus =
            serde_json::from_str(r#"{"state":"provisioned","url":"tcp://10.0.0.9:2375"}"#)
                .expect("decode");
        assert_eq!(status.state, DaemonState::Provisioned);
        assert_eq!(status.url, "tcp://10.0.0.9:2375");
    }

    #[test]
    fn test_daemon_state_unknown_tolerant() {
        let status: DaemonStatus =
            serde_json::from_str(r#"{"state":"warming-up"}"#).expect("decode");
        assert_eq!(status.state, DaemonState::Unknown);
    }

    #[test]
    fn test_daemon_state_parse() {
        assert_eq!(DaemonState::parse("pending"), DaemonState::Pending);
        assert_eq!(DaemonState::parse("provisioned"), DaemonState::Provisioned);
        assert_eq!(DaemonState::parse("error"), DaemonState::Error);
        assert_eq!(DaemonState::parse("warming-up"), DaemonState::Unknown);
    }

    #[test]
    fn test_daemon_state_display() {
        assert_eq!(DaemonState::Provisioned.to_string(), "provisioned");
        assert_eq!(DaemonState::Error.to_string(), "error");
    }
}

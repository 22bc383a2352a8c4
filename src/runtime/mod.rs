//! Container runtime boundary.
//!
//! The fleet controller and the lease verifier both talk to the container
//! runtime through the [`RuntimeClient`] trait so tests can substitute an
//! in-memory fake. The production implementation backed by bollard lives in
//! [`docker`].

mod docker;

pub use docker::{DockerConnector, DockerRuntime};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;

use crate::error::RuntimeError;

/// Everything needed to create and start one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    /// Image reference to run.
    pub image: String,
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
    /// Bind mounts in `host:container[:mode]` form.
    pub binds: Vec<String>,
}

/// Last observed state of one container.
#[derive(Debug, Clone)]
pub struct ContainerState {
    /// Runtime-assigned container ID.
    pub id: String,
    /// Observed status.
    pub status: ContainerStatus,
}

/// One entry from a label-filtered container listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Runtime-assigned container ID.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// Observed status.
    pub status: ContainerStatus,
}

/// Container status as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Removing,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    /// Parses the runtime's status string.
    pub fn parse(status: &str) -> Self {
        match status {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "exited" => ContainerStatus::Exited,
            "removing" => ContainerStatus::Removing,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Unknown(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        *self == ContainerStatus::Running
    }

    pub fn is_exited(&self) -> bool {
        *self == ContainerStatus::Exited
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Removing => write!(f, "removing"),
            ContainerStatus::Dead => write!(f, "dead"),
            ContainerStatus::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// Version information reported by a container daemon.
#[derive(Debug, Clone, Default)]
pub struct DaemonVersion {
    pub version: String,
    pub api_version: String,
}

/// Registry credentials for an authenticated image pull.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Client for a container runtime.
///
/// Implementations must be cheap to share; controllers hold them behind
/// `Arc<dyn RuntimeClient>`.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Creates and starts a container, returning the runtime-assigned ID.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Inspects a container by name or ID. Fails with
    /// [`RuntimeError::NotFound`] when it does not exist.
    async fn inspect(&self, name_or_id: &str) -> Result<ContainerState, RuntimeError>;

    /// Lists containers (running or not) carrying the given label.
    async fn list(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Removes a container.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Sends the kill signal to a running container.
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Streams combined stdout/stderr of a container in follow mode.
    ///
    /// The stream ends when the container is removed or the connection
    /// drops; consumers treat end-of-stream as "container is gone".
    fn stream_logs(&self, id: &str) -> BoxStream<'static, Result<Vec<u8>, RuntimeError>>;

    /// Finds the newest local image whose repo tag contains `pattern`.
    async fn find_local_image(&self, pattern: &str) -> Result<Option<String>, RuntimeError>;

    /// Pulls an image from a registry.
    async fn pull_image(
        &self,
        reference: &str,
        auth: Option<RegistryAuth>,
    ) -> Result<(), RuntimeError>;

    /// Fetches the daemon's version report.
    async fn server_version(&self) -> Result<DaemonVersion, RuntimeError>;
}

/// Opens a runtime connection at a URI and fetches its version.
///
/// This is the verification seam used by the lease client; the production
/// implementation is [`DockerConnector`].
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect_and_version(&self, uri: &str) -> Result<DaemonVersion, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_status_parse() {
        assert_eq!(ContainerStatus::parse("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::parse("created"), ContainerStatus::Created);
        assert_eq!(
            ContainerStatus::parse("zombie"),
            ContainerStatus::Unknown("zombie".to_string())
        );
    }

    #[test]
    fn test_container_status_predicates() {
        assert!(ContainerStatus::Running.is_running());
        assert!(!ContainerStatus::Running.is_exited());
        assert!(ContainerStatus::Exited.is_exited());
        assert!(!ContainerStatus::Dead.is_running());
    }

    #[test]
    fn test_container_status_display_roundtrip() {
        for status in ["created", "running", "exited", "dead"] {
            assert_eq!(ContainerStatus::parse(status).to_string(), status);
        }
    }
}

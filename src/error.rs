//! Error types for runnerctl operations.
//!
//! Defines error types for the major subsystems:
//! - Container runtime access (bollard boundary)
//! - Runner fleet control
//! - Remote daemon provisioning and leasing
//! - Registry tag listing and token exchange

use thiserror::Error;

/// Errors surfaced by the container runtime boundary.
///
/// The variants carry a structured classification so callers can branch on
/// the failure kind instead of inspecting error strings: `NotFound` maps a
/// 404 from the runtime API, `Unreachable` covers the connection-refused
/// class detected from the transport error chain.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container '{name}' not found")]
    NotFound { name: String },

    #[error("cannot reach container runtime: {0}")]
    Unreachable(String),

    #[error("runtime API error: {0}")]
    Api(String),

    #[error("log stream error: {0}")]
    Stream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Returns true when the error means the target container no longer
    /// exists on the runtime side.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

/// Errors that can occur while controlling a runner fleet.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("runner bearer token was not supplied (flag, config, or RUNNER_API_TOKEN)")]
    MissingToken,

    #[error("no runner image configured and none found in the local repository")]
    MissingImage,

    #[error("--all is not valid with --orgs, --apps, or --workflows")]
    ConflictingSelectors,

    #[error("--all must be specified when no other selection criteria is given")]
    MissingSelectors,

    #[error("there are no runner containers to stop")]
    NothingToStop,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors that can occur while provisioning a remote daemon lease.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning service returned an empty request id for run {run_id}")]
    EmptyRequestId { run_id: String },

    #[error("remote daemon provisioning failed for run {run_id}")]
    Failed { run_id: String },

    #[error("provisioning service returned an empty daemon uri for run {run_id}")]
    MissingUri { run_id: String },

    #[error("remote daemon provisioning timed out after {secs}s for run {run_id}")]
    TimedOut { run_id: String, secs: u64 },

    #[error("daemon uri {uri} does not point to a working container runtime: {detail}")]
    DaemonUnreachable { uri: String, detail: String },

    #[error("unidentifiable container runtime version at {uri}")]
    UnidentifiedDaemon { uri: String },

    #[error("provisioning transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors that can occur while talking to the image registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry credentials are not configured (RUNNER_REGISTRY_USER / RUNNER_REGISTRY_PASSWORD)")]
    MissingCredentials,

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected registry response: {0}")]
    Decode(String),

    #[error("no image tags found for {0}")]
    NoMatchingTag(String),
}

//! Remote daemon lease lifecycle.
//!
//! A [`LeaseClient`] obtains one remote container daemon for one run:
//! provision request, bounded status polling, endpoint verification, and
//! best-effort teardown.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ProvisionError, RuntimeError};
use crate::provision::{DaemonState, ProvisioningClient};
use crate::runtime::RuntimeConnector;

/// Fallback provisioning deadline when the configured value is unusable.
const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 300;

/// Parameters for one lease client.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Provisioning service endpoint, used for log correlation.
    pub service_endpoint: String,
    /// Provisioning deadline in seconds; values that cannot be converted
    /// fall back to 300s.
    pub provision_timeout_secs: i64,
    /// Interval between status polls.
    pub poll_interval: Duration,
}

impl LeaseConfig {
    pub fn new(service_endpoint: impl Into<String>) -> Self {
        Self {
            service_endpoint: service_endpoint.into(),
            provision_timeout_secs: DEFAULT_PROVISION_TIMEOUT_SECS as i64,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Identity of an established lease.
///
/// Only ever constructed fully populated, from a successful `provisioned`
/// poll carrying a non-empty URI.
#[derive(Debug, Clone)]
pub struct LeaseDetails {
    pub uri: String,
    pub request_id: String,
}

/// Drives one remote daemon lease through its lifecycle.
pub struct LeaseClient {
    config: LeaseConfig,
    run_id: String,
    provisioner: Arc<dyn ProvisioningClient>,
    connector: Arc<dyn RuntimeConnector>,
    details: Option<LeaseDetails>,
}

impl LeaseClient {
    pub fn new(
        config: LeaseConfig,
        run_id: impl Into<String>,
        provisioner: Arc<dyn ProvisioningClient>,
        connector: Arc<dyn RuntimeConnector>,
    ) -> Self {
        Self {
            config,
            run_id: run_id.into(),
            provisioner,
            connector,
            details: None,
        }
    }

    /// The established lease, if any.
    pub fn lease(&self) -> Option<&LeaseDetails> {
        self.details.as_ref()
    }

    /// Requests a remote daemon and polls until it is usable.
    ///
    /// Returns the daemon URI once the service reports `provisioned` and
    /// the endpoint passed verification. Transient status-poll failures are
    /// retried until the deadline; an explicit `error` state, a
    /// `provisioned` response without a URI, or the deadline firing are
    /// terminal.
    pub async fn provision(&mut self) -> Result<String, ProvisionError> {
        let ticket = match self.provisioner.provision(&self.run_id).await {
            Ok(ticket) => ticket,
            Err(e) => {
                error!(
                    endpoint = %self.config.service_endpoint,
                    run_id = %self.run_id,
                    error = %e,
                    "daemon provisioning request failed"
                );
                return Err(e);
            }
        };

        if ticket.request_id.is_empty() {
            error!(
                endpoint = %self.config.service_endpoint,
                run_id = %self.run_id,
                "provisioning service returned an empty request id"
            );
            return Err(ProvisionError::EmptyRequestId {
                run_id: self.run_id.clone(),
            });
        }

        let timeout_secs = resolve_timeout(self.config.provision_timeout_secs);
        let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    error!(
                        endpoint = %self.config.service_endpoint,
                        run_id = %self.run_id,
                        secs = timeout_secs,
                        "daemon provisioning timed out"
                    );
                    return Err(ProvisionError::TimedOut {
                        run_id: self.run_id.clone(),
                        secs: timeout_secs,
                    });
                }
                _ = ticker.tick() => {
                    let status = match self.provisioner.get_status(&ticket.request_id).await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(
                                run_id = %self.run_id,
                                error = %e,
                                "daemon status poll failed, retrying"
                            );
                            continue;
                        }
                    };

                    match status.state {
                        DaemonState::Error => {
                            error!(
                                endpoint = %self.config.service_endpoint,
                                run_id = %self.run_id,
                                "daemon provisioning reported an error state"
                            );
                            return Err(ProvisionError::Failed {
                                run_id: self.run_id.clone(),
                            });
                        }
                        DaemonState::Provisioned if status.url.is_empty() => {
                            error!(
                                endpoint = %self.config.service_endpoint,
                                run_id = %self.run_id,
                                "daemon provisioned without a uri"
                            );
                            return Err(ProvisionError::MissingUri {
                                run_id: self.run_id.clone(),
                            });
                        }
                        DaemonState::Provisioned => {
                            let details = LeaseDetails {
                                uri: status.url,
                                request_id: ticket.request_id.clone(),
                            };
                            // Record before verifying so a failed lease can
                            // still be deprovisioned by the caller.
                            self.details = Some(details.clone());
                            self.verify(&details).await?;
                            return Ok(details.uri);
                        }
                        state => {
                            info!(
                                run_id = %self.run_id,
                                state = %state,
                                "daemon provisioning in progress"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Releases the lease; without one this is a no-op.
    ///
    /// Teardown is best effort and never blocks caller shutdown: failures
    /// are logged and swallowed.
    pub async fn deprovision(&self) {
        let Some(details) = &self.details else {
            debug!(run_id = %self.run_id, "no daemon lease to deprovision");
            return;
        };

        if let Err(e) = self.provisioner.deprovision(&details.request_id).await {
            warn!(
                run_id = %self.run_id,
                request_id = %details.request_id,
                error = %e,
                "daemon deprovision failed, ignoring"
            );
        }
    }

    /// Confirms the leased URI points at a working daemon.
    async fn verify(&self, details: &LeaseDetails) -> Result<(), ProvisionError> {
        let version = match self.connector.connect_and_version(&details.uri).await {
            Ok(version) => version,
            Err(RuntimeError::Unreachable(detail)) => {
                return Err(ProvisionError::DaemonUnreachable {
                    uri: details.uri.clone(),
                    detail,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if version.version.is_empty() {
            return Err(ProvisionError::UnidentifiedDaemon {
                uri: details.uri.clone(),
            });
        }

        info!(
            uri = %details.uri,
            version = %version.version,
            api_version = %version.api_version,
            "connected to leased daemon"
        );
        Ok(())
    }
}

/// Converts the configured deadline to seconds, falling back when the
/// value is zero or negative.
fn resolve_timeout(configured: i64) -> u64 {
    match u64::try_from(configured) {
        Ok(secs) if secs > 0 => secs,
        _ => {
            warn!(
                configured,
                fallback = DEFAULT_PROVISION_TIMEOUT_SECS,
                "invalid provision timeout, using fallback"
            );
            DEFAULT_PROVISION_TIMEOUT_SECS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_timeout() {
        assert_eq!(resolve_timeout(7), 7);
        assert_eq!(resolve_timeout(0), DEFAULT_PROVISION_TIMEOUT_SECS);
        assert_eq!(resolve_timeout(-5), DEFAULT_PROVISION_TIMEOUT_SECS);
    }

    #[test]
    fn test_lease_config_defaults() {
        let config = LeaseConfig::new("http://provisioner:8080");
        assert_eq!(config.provision_timeout_secs, 300);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }
}

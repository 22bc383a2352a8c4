//! Runner fleet lifecycle control.
//!
//! [`FleetController`] owns the set of runner containers launched under one
//! base name: it validates the launch parameters, creates and starts the
//! containers, tracks each one through a [`RunnerHandle`], multiplexes
//! their logs, and reaps them as they exit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::FleetError;
use crate::fleet::logmux::LogStreamer;
use crate::runtime::{ContainerSpec, ContainerStatus, RuntimeClient};

/// Label attached to every container of a fleet; the value is the base name.
pub const FLEET_LABEL: &str = "runner-fleet";

/// Label carrying the runner group, attached only when a group is set.
pub const GROUP_LABEL: &str = "runner-group";

/// Known substring of the runner agent image's repo tag, used to discover
/// a usable image in the local repository.
pub const RUNNER_IMAGE_PATTERN: &str = "runnerctl/runner-agent";

/// Environment variable consulted when no bearer token is configured.
pub const TOKEN_ENV: &str = "RUNNER_API_TOKEN";

/// Shared state directory bind-mounted into every runner container.
const STATE_DIR: &str = "/var/lib/runnerctl";

/// Runtime control socket bind-mounted into every runner container.
const RUNTIME_SOCKET: &str = "/var/run/docker.sock";

/// Entry point executed inside the runner container.
const RUNNER_ENTRYPOINT: &str = "/runner-agent.sh";

/// Parameters for one fleet of runner containers.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Base name; containers are named `{base}_{seq}`.
    pub base_name: String,
    /// Number of runner containers to launch.
    pub count: usize,
    /// Image to run; empty means discover from the local repository.
    pub image: String,
    /// API bearer token; empty means read from the environment.
    pub bearer_token: String,
    /// Runner group name.
    pub group: String,
    /// Comma-separated organization selectors.
    pub orgs: String,
    /// Comma-separated application selectors.
    pub apps: String,
    /// Comma-separated workflow selectors.
    pub workflows: String,
    /// Accept work from everything the token can see.
    pub all: bool,
    /// Local artifact storage path, bind-mounted when set.
    pub store_path: String,
    /// Log output directory; empty routes logs to the console.
    pub log_path: String,
    /// Agent polling frequency in seconds, 0 for the agent default.
    pub poll_frequency: u32,
    /// Enable debug output in the agent.
    pub debug: bool,
    /// Enable journal logging in the agent.
    pub journal: bool,
    /// Delay between starting a container and reading back its ID.
    pub settle_delay: Duration,
    /// Interval between monitoring scans in `wait`.
    pub monitor_interval: Duration,
    /// Interval between exit polls during `stop`.
    pub stop_poll_interval: Duration,
}

impl FleetConfig {
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            count: 1,
            image: String::new(),
            bearer_token: String::new(),
            group: String::new(),
            orgs: String::new(),
            apps: String::new(),
            workflows: String::new(),
            all: false,
            store_path: String::new(),
            log_path: String::new(),
            poll_frequency: 0,
            debug: false,
            journal: false,
            settle_delay: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(5),
            stop_poll_interval: Duration::from_secs(1),
        }
    }
}

/// In-memory record of one live runner container.
///
/// A handle enters the active set only after the runtime confirmed the
/// container and assigned it an ID; `runtime_id` is never empty there.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    pub name: String,
    pub runtime_id: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
}

/// One row of a fleet status report.
#[derive(Debug, Clone)]
pub struct RunnerStatus {
    pub name: String,
    pub active: bool,
}

/// Controls the lifecycle of one fleet of runner containers.
pub struct FleetController {
    runtime: Arc<dyn RuntimeClient>,
    config: FleetConfig,
    handles: Vec<RunnerHandle>,
}

impl FleetController {
    pub fn new(config: FleetConfig, runtime: Arc<dyn RuntimeClient>) -> Self {
        Self {
            runtime,
            config,
            handles: Vec::new(),
        }
    }

    /// Handles currently tracked by the controller.
    pub fn handles(&self) -> &[RunnerHandle] {
        &self.handles
    }

    /// Launches the configured number of runner containers.
    ///
    /// Pre-flight failures (missing token, missing image, bad selectors)
    /// abort before anything is started. A failure to launch one instance
    /// is logged and skipped; the remaining instances are still attempted.
    ///
    /// Returns the number of containers actually launched.
    pub async fn start(&mut self) -> Result<usize, FleetError> {
        if self.config.count == 0 {
            return Ok(0);
        }

        let token = self.resolve_token()?;
        self.validate_selectors()?;
        let image = self.resolve_image().await?;

        // A fleet under this base name may already be running; launching a
        // second one would collide on container names.
        let existing = self
            .runtime
            .list(FLEET_LABEL, &self.config.base_name)
            .await?;
        if !existing.is_empty() {
            warn!(
                fleet = %self.config.base_name,
                count = existing.len(),
                "runner fleet already started"
            );
            return Ok(0);
        }

        let mut launched = 0;
        for seq in 1..=self.config.count {
            let name = format!("{}_{}", self.config.base_name, seq);
            match self.launch_one(&name, &image, &token).await {
                Ok(handle) => {
                    info!(container = %name, image = %image, "runner container started");
                    self.handles.push(handle);
                    launched += 1;
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "failed to launch runner container, skipping");
                }
            }
        }

        Ok(launched)
    }

    /// Reports each container of the fleet as active or inactive.
    ///
    /// Containers found in a non-running state are removed from the runtime
    /// as a side effect; running containers are never touched.
    pub async fn status(&self) -> Result<Vec<RunnerStatus>, FleetError> {
        let listed = self
            .runtime
            .list(FLEET_LABEL, &self.config.base_name)
            .await?;

        let mut report = Vec::with_capacity(listed.len());
        for container in listed {
            if container.status.is_running() {
                info!(
                    container = %container.name,
                    status = %container.status,
                    "runner container is active"
                );
                report.push(RunnerStatus {
                    name: container.name,
                    active: true,
                });
            } else {
                info!(container = %container.name, "removing inactive runner container");
                if let Err(e) = self.runtime.remove(&container.id).await {
                    warn!(container = %container.name, error = %e, "failed to remove inactive container");
                }
                report.push(RunnerStatus {
                    name: container.name,
                    active: false,
                });
            }
        }

        Ok(report)
    }

    /// Stops and removes every container of the fleet.
    ///
    /// Running containers are killed, then polled until the runtime reports
    /// them exited; an inspection error during the poll means the container
    /// is already gone and its removal is skipped.
    pub async fn stop(&self) -> Result<(), FleetError> {
        let listed = self
            .runtime
            .list(FLEET_LABEL, &self.config.base_name)
            .await?;
        if listed.is_empty() {
            return Err(FleetError::NothingToStop);
        }

        for container in listed {
            if !container.status.is_running() {
                info!(container = %container.name, "removing inactive runner container");
                if let Err(e) = self.runtime.remove(&container.id).await {
                    warn!(container = %container.name, error = %e, "failed to remove inactive container");
                }
                continue;
            }

            if let Err(e) = self.runtime.kill(&container.id).await {
                warn!(container = %container.name, error = %e, "failed to kill runner container");
                continue;
            }

            loop {
                tokio::time::sleep(self.config.stop_poll_interval).await;
                match self.runtime.inspect(&container.id).await {
                    Err(_) => break,
                    Ok(state) if state.status.is_exited() => {
                        if let Err(e) = self.runtime.remove(&container.id).await {
                            warn!(container = %container.name, error = %e, "failed to remove runner container");
                        }
                        info!(container = %container.name, "runner container has terminated");
                        break;
                    }
                    Ok(_) => {}
                }
            }
        }

        info!(fleet = %self.config.base_name, "runner fleet stopped");
        Ok(())
    }

    /// Blocks until every tracked runner container has exited.
    ///
    /// One log-streaming task runs per handle; each is signalled to unwind
    /// when its handle is reaped. The monitoring loop re-inspects a
    /// snapshot of the handles each interval and rebuilds the active set
    /// from the survivors, so removal never skips an entry.
    pub async fn wait(&mut self) -> Result<(), FleetError> {
        let log_dir = if self.config.log_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.config.log_path))
        };

        let mut shutdowns: HashMap<String, broadcast::Sender<()>> = HashMap::new();
        for handle in &self.handles {
            let (tx, rx) = broadcast::channel(1);
            shutdowns.insert(handle.name.clone(), tx);

            let streamer = LogStreamer::new(
                handle.name.clone(),
                handle.runtime_id.clone(),
                log_dir.clone(),
                Arc::clone(&self.runtime),
            );
            tokio::spawn(async move {
                streamer.run(rx).await;
            });
        }

        while !self.handles.is_empty() {
            tokio::time::sleep(self.config.monitor_interval).await;

            let snapshot = std::mem::take(&mut self.handles);
            let mut survivors = Vec::with_capacity(snapshot.len());

            for mut handle in snapshot {
                match self.runtime.inspect(&handle.runtime_id).await {
                    Err(e) => {
                        debug!(container = %handle.name, error = %e, "runner container is gone");
                        Self::signal_shutdown(&mut shutdowns, &handle.name);
                    }
                    Ok(state) if state.status.is_exited() => {
                        if let Err(e) = self.runtime.remove(&handle.runtime_id).await {
                            warn!(container = %handle.name, error = %e, "failed to remove runner container");
                        }
                        info!(container = %handle.name, "runner container has stopped");
                        Self::signal_shutdown(&mut shutdowns, &handle.name);
                    }
                    Ok(state) => {
                        handle.status = state.status;
                        survivors.push(handle);
                    }
                }
            }

            self.handles = survivors;
        }

        Ok(())
    }

    async fn launch_one(
        &self,
        name: &str,
        image: &str,
        token: &str,
    ) -> Result<RunnerHandle, FleetError> {
        let spec = ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            cmd: self.runner_command(name, image, token),
            env: self.runner_environment(token),
            labels: self.runner_labels(),
            binds: self.runner_binds(),
        };

        self.runtime.create_and_start(&spec).await?;

        // The runtime does not expose the final state immediately after
        // start; give it a moment, then read back the assigned ID.
        tokio::time::sleep(self.config.settle_delay).await;
        let state = self.runtime.inspect(name).await?;
        if state.id.is_empty() {
            return Err(FleetError::Runtime(crate::error::RuntimeError::Api(
                format!("runtime did not assign an id to container '{}'", name),
            )));
        }

        Ok(RunnerHandle {
            name: name.to_string(),
            runtime_id: state.id,
            status: state.status,
            created_at: Utc::now(),
        })
    }

    /// Builds the agent command line; a flag is included only when its
    /// parameter is set.
    fn runner_command(&self, name: &str, image: &str, token: &str) -> Vec<String> {
        let mut cmd = vec![
            RUNNER_ENTRYPOINT.to_string(),
            format!("--runner-image={}", image),
            format!("--runner-name={}", name),
            format!("--api-token={}", token),
        ];
        if !self.config.group.is_empty() {
            cmd.push(format!("--runner-group={}", self.config.group));
        }
        if !self.config.orgs.is_empty() {
            cmd.push(format!("--orgs={}", self.config.orgs));
        }
        if !self.config.apps.is_empty() {
            cmd.push(format!("--apps={}", self.config.apps));
        }
        if !self.config.workflows.is_empty() {
            cmd.push(format!("--workflows={}", self.config.workflows));
        }
        if !self.config.store_path.is_empty() {
            cmd.push(format!("--store-path={}", self.config.store_path));
        }
        if !self.config.log_path.is_empty() {
            cmd.push(format!("--logs-path={}", self.config.log_path));
        }
        if self.config.debug {
            cmd.push("-d".to_string());
        }
        if self.config.journal {
            cmd.push("--journal".to_string());
        }
        if self.config.all {
            cmd.push("--all".to_string());
        }
        if self.config.poll_frequency > 0 {
            cmd.push(format!("--poll-frequency={}", self.config.poll_frequency));
        }
        cmd
    }

    fn runner_environment(&self, token: &str) -> Vec<String> {
        let mut env = vec![format!("{}={}", TOKEN_ENV, token)];
        env.extend(proxy_environment());
        env
    }

    fn runner_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(FLEET_LABEL.to_string(), self.config.base_name.clone());
        if !self.config.group.is_empty() {
            labels.insert(GROUP_LABEL.to_string(), self.config.group.clone());
        }
        labels
    }

    fn runner_binds(&self) -> Vec<String> {
        let mut binds = vec![
            format!("{}:{}:rw", STATE_DIR, STATE_DIR),
            format!("{}:{}", RUNTIME_SOCKET, RUNTIME_SOCKET),
        ];
        if !self.config.log_path.is_empty() {
            binds.push(format!("{}:{}:rw", self.config.log_path, self.config.log_path));
        }
        if !self.config.store_path.is_empty() {
            binds.push(format!(
                "{}:{}:rw",
                self.config.store_path, self.config.store_path
            ));
        }
        binds
    }

    fn resolve_token(&self) -> Result<String, FleetError> {
        if !self.config.bearer_token.is_empty() {
            return Ok(self.config.bearer_token.clone());
        }
        match std::env::var(TOKEN_ENV) {
            Ok(token) if !token.is_empty() => Ok(token),
            _ => Err(FleetError::MissingToken),
        }
    }

    fn validate_selectors(&self) -> Result<(), FleetError> {
        let any_selector = !self.config.orgs.is_empty()
            || !self.config.apps.is_empty()
            || !self.config.workflows.is_empty();

        if self.config.all && any_selector {
            return Err(FleetError::ConflictingSelectors);
        }
        if !self.config.all && !any_selector {
            return Err(FleetError::MissingSelectors);
        }
        Ok(())
    }

    async fn resolve_image(&self) -> Result<String, FleetError> {
        if !self.config.image.is_empty() {
            return Ok(self.config.image.clone());
        }
        self.runtime
            .find_local_image(RUNNER_IMAGE_PATTERN)
            .await?
            .ok_or(FleetError::MissingImage)
    }

    fn signal_shutdown(shutdowns: &mut HashMap<String, broadcast::Sender<()>>, name: &str) {
        if let Some(tx) = shutdowns.remove(name) {
            // The streamer may already have exited with the stream.
            let _ = tx.send(());
        }
    }
}

/// Proxy-related variables forwarded from the controlling process into
/// every runner container.
fn proxy_environment() -> Vec<String> {
    std::env::vars()
        .filter(|(key, _)| {
            matches!(
                key.to_ascii_lowercase().as_str(),
                "http_proxy" | "https_proxy" | "no_proxy"
            )
        })
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector_config() -> FleetConfig {
        let mut config = FleetConfig::new("host1");
        config.bearer_token = "tok".to_string();
        config.image = "runnerctl/runner-agent:latest".to_string();
        config
    }

    #[test]
    fn test_fleet_config_defaults() {
        let config = FleetConfig::new("host1");
        assert_eq!(config.base_name, "host1");
        assert_eq!(config.count, 1);
        assert!(!config.all);
        assert_eq!(config.settle_delay, Duration::from_secs(1));
        assert_eq!(config.monitor_interval, Duration::from_secs(5));
        assert_eq!(config.stop_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_runner_command_minimal() {
        let mut config = selector_config();
        config.all = true;
        let controller = FleetController::new(config, test_runtime());

        let cmd = controller.runner_command("host1_1", "img:1", "tok");
        assert_eq!(cmd[0], RUNNER_ENTRYPOINT);
        assert!(cmd.contains(&"--runner-image=img:1".to_string()));
        assert!(cmd.contains(&"--runner-name=host1_1".to_string()));
        assert!(cmd.contains(&"--api-token=tok".to_string()));
        assert!(cmd.contains(&"--all".to_string()));
        assert!(!cmd.iter().any(|a| a.starts_with("--runner-group")));
        assert!(!cmd.iter().any(|a| a.starts_with("--poll-frequency")));
    }

    #[test]
    fn test_runner_command_full() {
        let mut config = selector_config();
        config.group = "g1".to_string();
        config.orgs = "org-a".to_string();
        config.store_path = "/data/store".to_string();
        config.log_path = "/data/logs".to_string();
        config.poll_frequency = 15;
        config.debug = true;
        config.journal = true;
        let controller = FleetController::new(config, test_runtime());

        let cmd = controller.runner_command("host1_1", "img:1", "tok");
        assert!(cmd.contains(&"--runner-group=g1".to_string()));
        assert!(cmd.contains(&"--orgs=org-a".to_string()));
        assert!(cmd.contains(&"--store-path=/data/store".to_string()));
        assert!(cmd.contains(&"--logs-path=/data/logs".to_string()));
        assert!(cmd.contains(&"-d".to_string()));
        assert!(cmd.contains(&"--journal".to_string()));
        assert!(cmd.contains(&"--poll-frequency=15".to_string()));
    }

    #[test]
    fn test_runner_labels() {
        let mut config = selector_config();
        config.group = "g1".to_string();
        let controller = FleetController::new(config, test_runtime());

        let labels = controller.runner_labels();
        assert_eq!(labels.get(FLEET_LABEL), Some(&"host1".to_string()));
        assert_eq!(labels.get(GROUP_LABEL), Some(&"g1".to_string()));
    }

    #[test]
    fn test_runner_binds_include_state_dir_and_socket() {
        let controller = FleetController::new(selector_config(), test_runtime());
        let binds = controller.runner_binds();
        assert!(binds.iter().any(|b| b.contains(STATE_DIR)));
        assert!(binds.iter().any(|b| b.contains(RUNTIME_SOCKET)));
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn test_validate_selectors() {
        let mut config = selector_config();
        config.all = true;
        assert!(FleetController::new(config, test_runtime())
            .validate_selectors()
            .is_ok());

        let mut config = selector_config();
        config.all = true;
        config.orgs = "o".to_string();
        assert!(matches!(
            FleetController::new(config, test_runtime()).validate_selectors(),
            Err(FleetError::ConflictingSelectors)
        ));

        let config = selector_config();
        assert!(matches!(
            FleetController::new(config, test_runtime()).validate_selectors(),
            Err(FleetError::MissingSelectors)
        ));
    }

    /// Minimal runtime stand-in for tests that never touch the runtime.
    fn test_runtime() -> Arc<dyn RuntimeClient> {
        use crate::error::RuntimeError;
        use crate::runtime::{ContainerState, ContainerSummary, DaemonVersion, RegistryAuth};
        use async_trait::async_trait;
        use futures::stream::BoxStream;

        struct NullRuntime;

        #[async_trait]
        impl RuntimeClient for NullRuntime {
            async fn create_and_start(&self, _: &ContainerSpec) -> Result<String, RuntimeError> {
                unreachable!("not exercised")
            }
            async fn inspect(&self, _: &str) -> Result<ContainerState, RuntimeError> {
                unreachable!("not exercised")
            }
            async fn list(
                &self,
                _: &str,
                _: &str,
            ) -> Result<Vec<ContainerSummary>, RuntimeError> {
                unreachable!("not exercised")
            }
            async fn remove(&self, _: &str) -> Result<(), RuntimeError> {
                unreachable!("not exercised")
            }
            async fn kill(&self, _: &str) -> Result<(), RuntimeError> {
                unreachable!("not exercised")
            }
            fn stream_logs(&self, _: &str) -> BoxStream<'static, Result<Vec<u8>, RuntimeError>> {
                unreachable!("not exercised")
            }
            async fn find_local_image(&self, _: &str) -> Result<Option<String>, RuntimeError> {
                unreachable!("not exercised")
            }
            async fn pull_image(
                &self,
                _: &str,
                _: Option<RegistryAuth>,
            ) -> Result<(), RuntimeError> {
                unreachable!("not exercised")
            }
            async fn server_version(&self) -> Result<DaemonVersion, RuntimeError> {
                unreachable!("not exercised")
            }
        }

        Arc::new(NullRuntime)
    }
}

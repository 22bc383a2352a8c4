//! Docker-backed runtime client using the bollard crate.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, ListContainersOptions,
    LogsOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::RuntimeError;
use crate::runtime::{
    ContainerSpec, ContainerState, ContainerStatus, ContainerSummary, DaemonVersion, RegistryAuth,
    RuntimeClient, RuntimeConnector,
};

/// Connection timeout for remote daemons, in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Runtime client talking to a Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local daemon, or to `endpoint` when given.
    ///
    /// `endpoint` accepts `unix://` socket paths and `tcp://`/`http://`
    /// addresses. Without an endpoint the usual environment defaults
    /// (DOCKER_HOST) apply.
    pub fn connect(endpoint: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match endpoint {
            None => Docker::connect_with_local_defaults(),
            Some(uri) if uri.starts_with("unix://") => Docker::connect_with_socket(
                uri.trim_start_matches("unix://"),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
            Some(uri) => Docker::connect_with_http(uri, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION),
        }
        .map_err(|e| classify("daemon", e))?;

        Ok(Self { docker })
    }

    /// Connects to a remote daemon URI, as handed out by the provisioning
    /// service.
    pub fn connect_remote(uri: &str) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_http(uri, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| classify(uri, e))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| classify(&spec.name, e))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(&spec.name, e))?;

        Ok(created.id)
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerState, RuntimeError> {
        let info = self
            .docker
            .inspect_container(name_or_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(name_or_id, e))?;

        let status = info
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default();

        Ok(ContainerState {
            id: info.id.unwrap_or_default(),
            status: ContainerStatus::parse(&status),
        })
    }

    async fn list(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", label_key, label_value)],
        );

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let listed = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| classify(label_value, e))?;

        Ok(listed
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                status: ContainerStatus::parse(&c.state.unwrap_or_default()),
            })
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await
            .map_err(|e| classify(id, e))
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| classify(id, e))
    }

    fn stream_logs(&self, id: &str) -> BoxStream<'static, Result<Vec<u8>, RuntimeError>> {
        let docker = self.docker.clone();
        let id = id.to_string();

        Box::pin(async_stream::stream! {
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            };

            let mut inner = docker.logs(&id, Some(options));
            while let Some(chunk) = inner.next().await {
                match chunk {
                    Ok(output) => yield Ok(output.into_bytes().to_vec()),
                    Err(e) => {
                        yield Err(classify(&id, e));
                        break;
                    }
                }
            }
        })
    }

    async fn find_local_image(&self, pattern: &str) -> Result<Option<String>, RuntimeError> {
        let options = ListImagesOptions::<String> {
            all: true,
            ..Default::default()
        };

        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(|e| classify(pattern, e))?;

        // More than one matching tag may exist locally; take the most
        // recently created one.
        let mut newest: Option<(i64, String)> = None;
        for image in images {
            for tag in &image.repo_tags {
                if tag.contains(pattern) {
                    match &newest {
                        Some((created, _)) if *created >= image.created => {}
                        _ => newest = Some((image.created, tag.clone())),
                    }
                    break;
                }
            }
        }

        Ok(newest.map(|(_, tag)| tag))
    }

    async fn pull_image(
        &self,
        reference: &str,
        auth: Option<RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username),
            password: Some(a.password),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(result) = stream.next().await {
            result.map_err(|e| classify(reference, e))?;
        }

        Ok(())
    }

    async fn server_version(&self) -> Result<DaemonVersion, RuntimeError> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| classify("version", e))?;

        Ok(DaemonVersion {
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
        })
    }
}

/// Production [`RuntimeConnector`]: one-shot connect + version probe
/// against a remote daemon URI.
pub struct DockerConnector;

#[async_trait]
impl RuntimeConnector for DockerConnector {
    async fn connect_and_version(&self, uri: &str) -> Result<DaemonVersion, RuntimeError> {
        let runtime = DockerRuntime::connect_remote(uri)?;
        runtime.server_version().await
    }
}

/// Maps a bollard error onto the structured [`RuntimeError`] taxonomy.
///
/// A 404 from the runtime API becomes `NotFound`; connection-refused-class
/// transport failures become `Unreachable`, detected by walking the error
/// source chain for an `io::Error` kind rather than matching on strings.
fn classify(target: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound {
            name: target.to_string(),
        },
        BollardError::IOError { ref err }
            if matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) =>
        {
            RuntimeError::Unreachable(err.to_string())
        }
        other => {
            if matches!(
                io_error_kind(&other),
                Some(
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                )
            ) {
                RuntimeError::Unreachable(other.to_string())
            } else {
                RuntimeError::Api(other.to_string())
            }
        }
    }
}

/// Walks an error's source chain looking for an `io::Error`.
fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: host1_1".to_string(),
        };
        assert!(matches!(
            classify("host1_1", err),
            RuntimeError::NotFound { name } if name == "host1_1"
        ));
    }

    #[test]
    fn test_classify_server_error_is_api() {
        let err = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "internal".to_string(),
        };
        assert!(matches!(classify("x", err), RuntimeError::Api(_)));
    }

    #[test]
    fn test_classify_connection_refused_is_unreachable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = BollardError::IOError { err: io };
        assert!(matches!(classify("x", err), RuntimeError::Unreachable(_)));
    }

    #[test]
    fn test_classify_other_io_is_api() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = BollardError::IOError { err: io };
        assert!(matches!(classify("x", err), RuntimeError::Api(_)));
    }
}

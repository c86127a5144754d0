//! Docker API abstraction for testability.
//!
//! The [`DockerClient`] trait abstracts the bollard Docker API, allowing
//! production code to use [`BollardDockerClient`] while tests use `MockDockerClient`.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │ provisioners · runner · collector · teardown │
//! └─────────────────────┬─────────────────────┘
//!                       │
//!                       ▼
//!                ┌─────────────┐
//!                │DockerClient │ (trait)
//!                └─────────────┘
//!                   │       │
//!                   ▼       ▼
//!              ┌───────┐ ┌────┐
//!              │Bollard│ │Mock│
//!              └───┬───┘ └────┘
//!                  │
//!                  ▼
//!            Docker Daemon
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::debug;

use testbed_core::types::ServiceSpec;

use crate::error::ContainerError;

/// Grace period before the daemon kills a stopping container.
const STOP_GRACE_SECS: i64 = 10;

/// Result of a one-shot exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code; `None` if the daemon never reported one
    pub exit_code: Option<i64>,
    /// Combined stdout/stderr
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait abstracting Docker API operations.
///
/// All Docker API calls go through this trait, enabling testability via mocking.
/// The trait is `Send + Sync + 'static`, allowing safe sharing across async contexts.
///
/// # Implementations
///
/// - [`BollardDockerClient`]: Production implementation using the `bollard` library
/// - `MockDockerClient`: Test implementation with scripted responses (available in tests only)
pub trait DockerClient: Send + Sync + 'static {
    /// Creates a user-defined bridge network and returns its id.
    fn create_network(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<String, ContainerError>> + Send;

    /// Removes a network by id or name.
    fn remove_network(&self, id: &str)
    -> impl Future<Output = Result<(), ContainerError>> + Send;

    /// Creates (but does not start) a container attached to `network` under
    /// `spec.alias`. Pulls the image first if it is not present.
    ///
    /// Returns the container id.
    fn create_container(
        &self,
        spec: &ServiceSpec,
        network: &str,
    ) -> impl Future<Output = Result<String, ContainerError>> + Send;

    /// Extracts a tar archive into `path` inside the container.
    fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> impl Future<Output = Result<(), ContainerError>> + Send;

    /// Starts a created container.
    fn start_container(&self, id: &str)
    -> impl Future<Output = Result<(), ContainerError>> + Send;

    /// Runs `cmd` inside a running container and waits for it to finish.
    ///
    /// A non-zero exit code is reported in [`ExecOutput`], not as an error.
    fn exec(
        &self,
        id: &str,
        cmd: &[String],
    ) -> impl Future<Output = Result<ExecOutput, ContainerError>> + Send;

    /// Streams `path` out of the container as a tar archive.
    fn download_archive<'a>(
        &'a self,
        id: &'a str,
        path: &'a str,
    ) -> BoxStream<'a, Result<Bytes, ContainerError>>;

    /// Follows the container's stdout/stderr until it exits.
    fn follow_logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String, ContainerError>>;

    /// Stops the container and removes it together with its anonymous volumes.
    ///
    /// # Errors
    ///
    /// - `ContainerError::ContainerNotFound`: the container is already gone
    fn stop_container(&self, id: &str)
    -> impl Future<Output = Result<(), ContainerError>> + Send;

    /// Checks Docker daemon connectivity.
    fn ping(&self) -> impl Future<Output = Result<(), ContainerError>> + Send;
}

/// Production Docker client implementation using `bollard`.
///
/// Internally uses `Arc<bollard::Docker>` for safe sharing across async tasks.
pub struct BollardDockerClient {
    docker: Arc<bollard::Docker>,
}

impl BollardDockerClient {
    /// Connects to Docker using the default local socket.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::DockerConnection` if the connection fails
    /// (e.g., socket not found, permission denied, daemon not running).
    pub fn connect_local() -> Result<Self, ContainerError> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            ContainerError::DockerConnection(format!("failed to connect to docker: {e}"))
        })?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    /// Connects to Docker using a specific socket path.
    pub fn connect_with_socket(socket_path: &str) -> Result<Self, ContainerError> {
        let docker =
            bollard::Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    ContainerError::DockerConnection(format!(
                        "failed to connect to docker at {socket_path}: {e}"
                    ))
                })?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        use bollard::image::CreateImageOptions;

        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_owned(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|e| ContainerError::DockerApi(format!("pull {image} failed: {e}")))?;
        }
        Ok(())
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl DockerClient for BollardDockerClient {
    async fn create_network(&self, name: &str) -> Result<String, ContainerError> {
        use bollard::network::CreateNetworkOptions;

        let options = CreateNetworkOptions {
            name: name.to_owned(),
            driver: "bridge".to_owned(),
            check_duplicate: true,
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| ContainerError::DockerApi(format!("create network {name} failed: {e}")))?;
        // The name is unique per run and accepted wherever an id is.
        Ok(name.to_owned())
    }

    async fn remove_network(&self, id: &str) -> Result<(), ContainerError> {
        self.docker.remove_network(id).await.map_err(|e| {
            if is_not_found(&e) {
                ContainerError::ContainerNotFound(format!("network {id}"))
            } else {
                ContainerError::DockerApi(format!("remove network {id} failed: {e}"))
            }
        })
    }

    async fn create_container(
        &self,
        spec: &ServiceSpec,
        network: &str,
    ) -> Result<String, ContainerError> {
        use bollard::container::{Config, CreateContainerOptions, NetworkingConfig};
        use bollard::models::{EndpointSettings, HostConfig};

        self.ensure_image(&spec.image).await?;

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();

        let mut endpoints = HashMap::new();
        endpoints.insert(
            network.to_owned(),
            EndpointSettings {
                aliases: Some(vec![spec.alias.clone()]),
                ..Default::default()
            },
        );

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            cmd: spec.command.clone(),
            entrypoint: spec.entrypoint.clone(),
            working_dir: spec.working_dir.clone(),
            host_config: Some(HostConfig {
                network_mode: Some(network.to_owned()),
                publish_all_ports: Some(!spec.ports.is_empty()),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                ContainerError::DockerApi(format!("create container {} failed: {e}", spec.name))
            })?;
        Ok(response.id)
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), ContainerError> {
        use bollard::container::UploadToContainerOptions;

        let options = UploadToContainerOptions {
            path: path.to_owned(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive.into())
            .await
            .map_err(|e| ContainerError::DockerApi(format!("upload to {id}:{path} failed: {e}")))
    }

    async fn start_container(&self, id: &str) -> Result<(), ContainerError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| ContainerError::DockerApi(format!("start container {id} failed: {e}")))
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, ContainerError> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let exec_err = |reason: String| ContainerError::Exec {
            container_id: id.to_owned(),
            reason,
        };

        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| exec_err(format!("create exec failed: {e}")))?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|e| exec_err(format!("start exec failed: {e}")))?
        {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| exec_err(format!("output stream failed: {e}")))?;
                    output.push_str(&chunk.to_string());
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|e| exec_err(format!("inspect exec failed: {e}")))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            output,
        })
    }

    fn download_archive<'a>(
        &'a self,
        id: &'a str,
        path: &'a str,
    ) -> BoxStream<'a, Result<Bytes, ContainerError>> {
        use bollard::container::DownloadFromContainerOptions;

        let options = DownloadFromContainerOptions {
            path: path.to_owned(),
        };
        self.docker
            .download_from_container(id, Some(options))
            .map(move |chunk| {
                chunk.map_err(|e| {
                    ContainerError::Collection(format!("download {id}:{path} failed: {e}"))
                })
            })
            .boxed()
    }

    fn follow_logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String, ContainerError>> {
        use bollard::container::LogsOptions;

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .map(move |line| {
                line.map(|l| l.to_string())
                    .map_err(|e| ContainerError::DockerApi(format!("logs of {id} failed: {e}")))
            })
            .boxed()
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerError> {
        use bollard::container::{RemoveContainerOptions, StopContainerOptions};

        // A container that already exited answers 304; removal below still
        // has to happen.
        if let Err(e) = self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            if is_not_found(&e) {
                return Err(ContainerError::ContainerNotFound(id.to_owned()));
            }
            debug!(container_id = id, error = %e, "stop returned an error, forcing removal");
        }

        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ContainerError::ContainerNotFound(id.to_owned())
                } else {
                    ContainerError::DockerApi(format!("remove container {id} failed: {e}"))
                }
            })
    }

    async fn ping(&self) -> Result<(), ContainerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| ContainerError::DockerConnection(format!("ping failed: {e}")))?;
        Ok(())
    }
}

/// A call recorded by `MockDockerClient`.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateNetwork(String),
    RemoveNetwork(String),
    Create(String),
    Upload { container: String, path: String },
    Start(String),
    Exec { container: String, cmd: Vec<String> },
    Download { container: String, path: String },
    Logs(String),
    Stop(String),
}

/// Scripted exec handler: `(container name, argv) -> result`.
#[cfg(test)]
type ExecHandler = Box<dyn Fn(&str, &[String]) -> Result<ExecOutput, ContainerError> + Send + Sync>;

/// Mock Docker client for tests.
///
/// Containers get the id `id-<name>`; every call is recorded in order.
/// Failures are scripted by container name.
#[cfg(test)]
#[derive(Default)]
pub struct MockDockerClient {
    calls: std::sync::Mutex<Vec<MockCall>>,
    names: std::sync::Mutex<HashMap<String, String>>,
    fail_network: bool,
    fail_create: std::collections::HashSet<String>,
    fail_start: std::collections::HashSet<String>,
    fail_stop: std::collections::HashSet<String>,
    exec_handler: Option<ExecHandler>,
    archive: Option<Result<Vec<u8>, String>>,
}

#[cfg(test)]
impl MockDockerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_network(mut self) -> Self {
        self.fail_network = true;
        self
    }

    pub fn with_failing_create(mut self, name: &str) -> Self {
        self.fail_create.insert(name.to_owned());
        self
    }

    pub fn with_failing_start(mut self, name: &str) -> Self {
        self.fail_start.insert(name.to_owned());
        self
    }

    pub fn with_failing_stop(mut self, name: &str) -> Self {
        self.fail_stop.insert(name.to_owned());
        self
    }

    /// Scripts every exec; without a handler every exec exits 0.
    pub fn with_exec<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> Result<ExecOutput, ContainerError> + Send + Sync + 'static,
    {
        self.exec_handler = Some(Box::new(handler));
        self
    }

    /// Archive bytes returned by `download_archive`; `Err` fails mid-stream.
    pub fn with_archive(mut self, archive: Result<Vec<u8>, String>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().expect("mock lock").clone()
    }

    /// Names of containers stopped, in call order.
    pub fn stopped(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Stop(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Number of exec calls against a container.
    pub fn exec_count(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Exec { container, .. } if container == name))
            .count()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().expect("mock lock").push(call);
    }

    fn name_of(&self, id: &str) -> String {
        self.names
            .lock()
            .expect("mock lock")
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_owned())
    }
}

#[cfg(test)]
impl DockerClient for MockDockerClient {
    async fn create_network(&self, name: &str) -> Result<String, ContainerError> {
        if self.fail_network {
            return Err(ContainerError::DockerApi("mock network failure".to_owned()));
        }
        self.record(MockCall::CreateNetwork(name.to_owned()));
        Ok(format!("net-{name}"))
    }

    async fn remove_network(&self, id: &str) -> Result<(), ContainerError> {
        self.record(MockCall::RemoveNetwork(id.to_owned()));
        Ok(())
    }

    async fn create_container(
        &self,
        spec: &ServiceSpec,
        _network: &str,
    ) -> Result<String, ContainerError> {
        if self.fail_create.contains(&spec.name) {
            return Err(ContainerError::DockerApi(format!(
                "mock create failure for {}",
                spec.name
            )));
        }
        self.record(MockCall::Create(spec.name.clone()));
        let id = format!("id-{}", spec.name);
        self.names
            .lock()
            .expect("mock lock")
            .insert(id.clone(), spec.name.clone());
        Ok(id)
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        _archive: Vec<u8>,
    ) -> Result<(), ContainerError> {
        self.record(MockCall::Upload {
            container: self.name_of(id),
            path: path.to_owned(),
        });
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<(), ContainerError> {
        let name = self.name_of(id);
        if self.fail_start.contains(&name) {
            return Err(ContainerError::DockerApi(format!(
                "mock start failure for {name}"
            )));
        }
        self.record(MockCall::Start(name));
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, ContainerError> {
        let name = self.name_of(id);
        self.record(MockCall::Exec {
            container: name.clone(),
            cmd: cmd.to_vec(),
        });
        match &self.exec_handler {
            Some(handler) => handler(&name, cmd),
            None => Ok(ExecOutput {
                exit_code: Some(0),
                output: String::new(),
            }),
        }
    }

    fn download_archive<'a>(
        &'a self,
        id: &'a str,
        path: &'a str,
    ) -> BoxStream<'a, Result<Bytes, ContainerError>> {
        self.record(MockCall::Download {
            container: self.name_of(id),
            path: path.to_owned(),
        });
        let items: Vec<Result<Bytes, ContainerError>> = match &self.archive {
            Some(Ok(bytes)) => bytes
                .chunks(512)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect(),
            Some(Err(reason)) => vec![
                Ok(Bytes::from_static(b"partial")),
                Err(ContainerError::Collection(reason.clone())),
            ],
            None => vec![Err(ContainerError::Collection(
                "no archive scripted".to_owned(),
            ))],
        };
        futures_util::stream::iter(items).boxed()
    }

    fn follow_logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String, ContainerError>> {
        self.record(MockCall::Logs(self.name_of(id)));
        futures_util::stream::iter(vec![Ok("mock log line".to_owned())]).boxed()
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerError> {
        let name = self.name_of(id);
        self.record(MockCall::Stop(name.clone()));
        if self.fail_stop.contains(&name) {
            return Err(ContainerError::ContainerNotFound(id.to_owned()));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), ContainerError> {
        Ok(())
    }
}

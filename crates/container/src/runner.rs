//! Test Runner -- an idle container that receives the workspace and runs the
//! suite as a one-shot exec.
//!
//! Failing to create or start the container is
//! [`ContainerError::RunnerUnavailable`]; failing to run the exec is
//! [`ContainerError::Exec`]. A non-zero exit of the suite is neither: it is a
//! [`TestOutcome`] like any other.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use testbed_core::config::RunnerConfig;
use testbed_core::metrics as m;
use testbed_core::mock::MockRegistry;
use testbed_core::types::{ServiceSpec, TestOutcome};

use crate::archive;
use crate::docker::DockerClient;
use crate::error::ContainerError;
use crate::network::NetworkHandle;
use crate::provision::{ServiceProvisioner, ServiceRole, StartedService};
use crate::teardown::ResourceStack;

/// Environment variable carrying the mock rules as JSON.
pub const MOCKS_ENV: &str = "TESTBED_MOCKS";

/// Network alias of the runner.
pub const RUNNER_ALIAS: &str = "test-runner";

/// Builds the runner spec.
pub fn service_spec(
    config: &RunnerConfig,
    network: &NetworkHandle,
    mocks: &MockRegistry,
) -> Result<ServiceSpec, ContainerError> {
    let mocks_json = mocks.to_json().map_err(|e| ContainerError::Config {
        field: "mocks".to_owned(),
        reason: e.to_string(),
    })?;

    Ok(ServiceSpec::new(
        format!("{}-runner", network.name),
        &config.image,
        RUNNER_ALIAS,
    )
    .with_entrypoint(vec![
        "tail".to_owned(),
        "-f".to_owned(),
        "/dev/null".to_owned(),
    ])
    .with_working_dir(&config.workdir)
    .with_env(config.env.clone())
    .with_env([(MOCKS_ENV, mocks_json)]))
}

/// A started runner. Dropping it does not stop the container.
#[derive(Debug)]
pub struct RunnerHandle {
    pub service: StartedService,
    log_task: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    /// Stops forwarding container output. Idempotent.
    pub fn stop_log_forwarding(&mut self) {
        if let Some(task) = self.log_task.take() {
            task.abort();
        }
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        self.stop_log_forwarding();
    }
}

pub struct TestRunner<D: DockerClient> {
    docker: Arc<D>,
    provisioner: ServiceProvisioner<D>,
}

impl<D: DockerClient> TestRunner<D> {
    pub fn new(docker: Arc<D>) -> Self {
        Self {
            provisioner: ServiceProvisioner::new(Arc::clone(&docker)),
            docker,
        }
    }

    /// Starts the runner and copies `workspace` into its working directory.
    ///
    /// Whatever container got created is on `stack`, even on error.
    pub async fn start(
        &self,
        spec: &ServiceSpec,
        workspace: &Path,
        network: &NetworkHandle,
        stack: &mut ResourceStack,
    ) -> Result<RunnerHandle, ContainerError> {
        let service = self
            .provisioner
            .launch(spec, ServiceRole::TestRunner, network, stack)
            .await
            .map_err(|e| ContainerError::RunnerUnavailable(e.to_string()))?;

        let root: PathBuf = workspace.to_path_buf();
        let bundle = tokio::task::spawn_blocking(move || {
            archive::pack_dir(&root, &archive::WORKSPACE_SKIP)
        })
        .await
        .map_err(|e| ContainerError::RunnerUnavailable(format!("packing task failed: {e}")))?
        .map_err(|e| ContainerError::RunnerUnavailable(e.to_string()))?;

        let target = spec.working_dir.as_deref().unwrap_or("/");
        info!(
            container_id = %service.container_id,
            bytes = bundle.len(),
            target,
            "copying workspace into runner"
        );
        self.docker
            .upload_archive(&service.container_id, target, bundle)
            .await
            .map_err(|e| ContainerError::RunnerUnavailable(e.to_string()))?;

        // Only a runner that is fully set up gets a forwarder; the handle
        // owns it from here on.
        let log_task = self.forward_logs(&service);
        Ok(RunnerHandle {
            service,
            log_task: Some(log_task),
        })
    }

    /// Executes the test command and captures its outcome.
    ///
    /// # Errors
    ///
    /// `ContainerError::Exec` when the exec itself could not be run.
    pub async fn execute(
        &self,
        runner: &RunnerHandle,
        command: &[String],
    ) -> Result<TestOutcome, ContainerError> {
        info!(command = %command.join(" "), "running test suite");
        let result = self
            .docker
            .exec(&runner.service.container_id, command)
            .await
            .map_err(|e| match e {
                e @ ContainerError::Exec { .. } => e,
                other => ContainerError::Exec {
                    container_id: runner.service.container_id.clone(),
                    reason: other.to_string(),
                },
            });

        let outcome = match result {
            Ok(out) => TestOutcome {
                exit_code: out.exit_code,
                output: out.output,
            },
            Err(e) => {
                metrics::counter!(m::RUNS_TOTAL, m::LABEL_RESULT => "error").increment(1);
                return Err(e);
            }
        };

        // Exec output never reaches the container log stream.
        for line in outcome.output.lines() {
            info!(target: "runner", "{line}");
        }

        let label = if outcome.success() { "success" } else { "failure" };
        metrics::counter!(m::RUNS_TOTAL, m::LABEL_RESULT => label).increment(1);
        info!(outcome = %outcome, "test suite finished");
        Ok(outcome)
    }

    fn forward_logs(&self, service: &StartedService) -> JoinHandle<()> {
        let docker = Arc::clone(&self.docker);
        let id = service.container_id.clone();
        tokio::spawn(async move {
            let mut lines = docker.follow_logs(&id);
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => info!(target: "runner", "{}", line.trim_end()),
                    Err(e) => {
                        debug!(error = %e, "runner log stream ended");
                        break;
                    }
                }
            }
        })
    }
}

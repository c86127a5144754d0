//! Run orchestration -- provisioning, test execution, artifact collection
//! and teardown.
//!
//! The [`Orchestrator`] is the central coordinator of `testbed`. It wires
//! every component in dependency order and guarantees that whatever was
//! acquired is released, whatever happened in between.
//!
//! # Startup Order (dependencies first)
//!
//! 1. Network
//! 2. Database (health-gated, then bootstrapped)
//! 3. Identity provider (every realm must answer)
//! 4. Shell (primary application container)
//! 5. Remaining application containers (concurrently)
//! 6. Test runner, then the test exec
//!
//! # Shutdown Order (exact reverse of acquisition)
//!
//! Artifacts are collected from the runner first; then every acquired
//! resource is released newest-first by the `TeardownCoordinator`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use testbed_container::provision::app_spec;
use testbed_container::{
    ArtifactCollector, ArtifactTarget, ContainerError, DatabaseProvisioner, DockerClient,
    IdentityProvisioner, NetworkManager, ResourceStack, ServiceProvisioner, ServiceRole,
    TeardownCoordinator, TeardownReport, TestRunner, runner,
};
use testbed_core::config::RunConfig;
use testbed_core::error::TestbedError;
use testbed_core::metrics as m;
use testbed_core::mock::MockRegistry;
use testbed_core::types::{ArtifactBundle, TestOutcome};

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Result of the test command; `None` if it never ran
    pub outcome: Option<TestOutcome>,
    /// The fatal error that aborted the run, if any
    pub error: Option<TestbedError>,
    /// Artifact collection result; `None` if the runner never started
    pub collection: Option<Result<ArtifactBundle, ContainerError>>,
    /// Resources released (and not) during teardown
    pub teardown: TeardownReport,
}

impl RunReport {
    /// `true` iff the test command exited 0.
    pub fn passed(&self) -> bool {
        self.outcome.as_ref().is_some_and(TestOutcome::success)
    }

    /// Process exit code: 0 iff the test command exited 0, 1 otherwise.
    ///
    /// Artifact collection and teardown never influence it.
    pub fn exit_code(&self) -> u8 {
        if self.passed() { 0 } else { 1 }
    }
}

/// The run orchestrator.
pub struct Orchestrator<D: DockerClient> {
    /// Validated configuration
    config: RunConfig,
    /// Base for relative paths; copied into the runner
    workspace: PathBuf,
    docker: Arc<D>,
    /// Network-mock rules handed to the runner
    mocks: MockRegistry,
}

impl<D: DockerClient> Orchestrator<D> {
    /// Validates `config` and builds the orchestrator.
    pub fn new(
        config: RunConfig,
        workspace: impl Into<PathBuf>,
        docker: Arc<D>,
    ) -> Result<Self, TestbedError> {
        config.validate()?;
        let mocks = MockRegistry::new(config.mocks.clone())?;
        Ok(Self {
            config,
            workspace: workspace.into(),
            docker,
            mocks,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn mocks(&self) -> &MockRegistry {
        &self.mocks
    }

    /// Runs the whole lifecycle. Never returns early: teardown always runs
    /// over everything acquired so far.
    pub async fn run(&self) -> RunReport {
        let mut report = RunReport::default();
        let mut stack = ResourceStack::new();

        if let Err(e) = self.provision_and_test(&mut stack, &mut report).await {
            let err = TestbedError::from(e);
            error!(kind = err.kind(), error = %err, "run aborted");
            // Runs that reached the exec were counted by the runner.
            if report.collection.is_none() {
                metrics::counter!(m::RUNS_TOTAL, m::LABEL_RESULT => "aborted").increment(1);
            }
            report.error = Some(err);
        }

        report.teardown = TeardownCoordinator::new(Arc::clone(&self.docker))
            .teardown(stack)
            .await;
        report
    }

    async fn provision_and_test(
        &self,
        stack: &mut ResourceStack,
        report: &mut RunReport,
    ) -> Result<(), ContainerError> {
        self.docker.ping().await?;

        let network = NetworkManager::new(
            Arc::clone(&self.docker),
            &self.config.general.network_prefix,
        )
        .create()
        .await?;
        stack.push_network(network.clone());

        DatabaseProvisioner::new(Arc::clone(&self.docker))
            .start(&self.config.database, &network, stack)
            .await?;

        IdentityProvisioner::new(Arc::clone(&self.docker))
            .start(&self.config.keycloak, &self.workspace, &network, stack)
            .await?;

        let provisioner = ServiceProvisioner::new(Arc::clone(&self.docker));
        let shell = app_spec(&self.config.shell, "shell")?;
        provisioner
            .start(&shell, ServiceRole::Shell, &network, stack)
            .await?;

        let extras = self
            .config
            .containers
            .iter()
            .enumerate()
            .map(|(i, c)| app_spec(c, &format!("containers[{i}]")))
            .collect::<Result<Vec<_>, _>>()?;
        if !extras.is_empty() {
            provisioner
                .start_all(&extras, ServiceRole::Application, &network, stack)
                .await?;
        }

        let test_runner = TestRunner::new(Arc::clone(&self.docker));
        let spec = runner::service_spec(&self.config.runner, &network, &self.mocks)?;
        let mut handle = test_runner
            .start(&spec, &self.workspace, &network, stack)
            .await?;

        let executed = test_runner
            .execute(&handle, &self.config.runner.command)
            .await;

        // Runs for pass, fail and exec error alike; returns only once the
        // archive is on disk.
        let collection = ArtifactCollector::new(Arc::clone(&self.docker))
            .collect(&handle.service, &self.artifact_target())
            .await;
        handle.stop_log_forwarding();
        report.collection = Some(collection);

        report.outcome = Some(executed?);
        Ok(())
    }

    fn artifact_target(&self) -> ArtifactTarget {
        let runner = &self.config.runner;
        ArtifactTarget {
            source: runner.artifacts_path.clone(),
            archive_path: resolve(&self.workspace, &runner.archive_path),
            extract_dir: resolve(&self.workspace, &runner.extract_dir),
        }
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    base.join(path)
}

/// Logs the single final pass/fail line.
pub fn log_summary(report: &RunReport) {
    let code = report.exit_code();
    let result = if report.passed() { "passed" } else { "failed" };

    match (&report.outcome, &report.error) {
        (Some(outcome), _) => info!(result, exit_code = code, test = %outcome, "run finished"),
        (None, Some(err)) => {
            info!(result, exit_code = code, error_kind = err.kind(), "run finished")
        }
        (None, None) => info!(result, exit_code = code, "run finished"),
    }
}

//! Service provisioners.
//!
//! [`ServiceProvisioner`] is the generic path every container takes:
//! create on the run network, record in the [`ResourceStack`], copy files,
//! start, and gate on the [`HealthCheckPoller`] when a policy is present.
//! [`database`] and [`identity`] specialize it.

pub mod database;
pub mod identity;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tracing::{info, warn};

use testbed_core::config::AppContainerConfig;
use testbed_core::metrics as m;
use testbed_core::types::ServiceSpec;

use crate::archive;
use crate::docker::DockerClient;
use crate::error::ContainerError;
use crate::health::HealthCheckPoller;
use crate::network::NetworkHandle;
use crate::teardown::ResourceStack;

pub use database::DatabaseProvisioner;
pub use identity::IdentityProvisioner;

/// What a container is for. Drives log fields and metrics labels only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    Database,
    IdentityProvider,
    Shell,
    Application,
    TestRunner,
}

impl ServiceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::IdentityProvider => "identity_provider",
            Self::Shell => "shell",
            Self::Application => "application",
            Self::TestRunner => "test_runner",
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime handle of a created container.
///
/// Stopping goes through the [`TeardownCoordinator`](crate::teardown::TeardownCoordinator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedService {
    pub name: String,
    pub container_id: String,
    pub alias: String,
    pub role: ServiceRole,
}

/// Builds the [`ServiceSpec`] of an application container (the shell or an extra one).
pub fn app_spec(config: &AppContainerConfig, field: &str) -> Result<ServiceSpec, ContainerError> {
    let mut spec = ServiceSpec::new(&config.name, &config.image, &config.alias)
        .with_env(config.env.clone())
        .with_port(config.port);
    if let Some(check) = &config.health_check {
        spec = spec.with_health_check(check.to_policy(&format!("{field}.healthCheck"))?);
    }
    Ok(spec)
}

/// Generic provisioner.
pub struct ServiceProvisioner<D: DockerClient> {
    docker: Arc<D>,
    poller: HealthCheckPoller<D>,
}

impl<D: DockerClient> ServiceProvisioner<D> {
    pub fn new(docker: Arc<D>) -> Self {
        Self {
            poller: HealthCheckPoller::new(Arc::clone(&docker)),
            docker,
        }
    }

    /// Starts `spec` and waits for readiness.
    ///
    /// The container is pushed onto `stack` as soon as it is created, so a
    /// failure in any later step still leaves it for teardown.
    pub async fn start(
        &self,
        spec: &ServiceSpec,
        role: ServiceRole,
        network: &NetworkHandle,
        stack: &mut ResourceStack,
    ) -> Result<StartedService, ContainerError> {
        self.start_bounded(spec, role, network, stack, None).await
    }

    /// Like [`start`](Self::start), with an optional upper bound on the whole
    /// readiness wait.
    pub async fn start_bounded(
        &self,
        spec: &ServiceSpec,
        role: ServiceRole,
        network: &NetworkHandle,
        stack: &mut ResourceStack,
        ready_within: Option<Duration>,
    ) -> Result<StartedService, ContainerError> {
        let started_at = Instant::now();
        let service = self.launch(spec, role, network, stack).await?;

        match &spec.health_check {
            Some(policy) => {
                let wait = self
                    .poller
                    .wait_ready(&spec.name, &service.container_id, policy);
                match ready_within {
                    Some(limit) => match tokio::time::timeout(limit, wait).await {
                        Ok(result) => result?,
                        Err(_elapsed) => {
                            warn!(
                                service = %spec.name,
                                limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                                "startup timeout exceeded"
                            );
                            return Err(ContainerError::StartupTimeout {
                                service: spec.name.clone(),
                                last_error: format!(
                                    "not ready within {}ms",
                                    limit.as_millis()
                                ),
                            });
                        }
                    },
                    None => wait.await?,
                };
            }
            None => {
                info!(
                    service = %spec.name,
                    "no health check configured, treating running as ready"
                );
            }
        }

        metrics::histogram!(
            m::SERVICE_STARTUP_DURATION_SECONDS,
            m::LABEL_SERVICE => spec.name.clone()
        )
        .record(started_at.elapsed().as_secs_f64());
        Ok(service)
    }

    /// Creates, records, copies files into and starts a container. No
    /// readiness gate.
    pub async fn launch(
        &self,
        spec: &ServiceSpec,
        role: ServiceRole,
        network: &NetworkHandle,
        stack: &mut ResourceStack,
    ) -> Result<StartedService, ContainerError> {
        let container_id = self.docker.create_container(spec, &network.id).await?;
        let service = StartedService {
            name: spec.name.clone(),
            container_id,
            alias: spec.alias.clone(),
            role,
        };
        stack.push_container(service.clone());

        if !spec.files.is_empty() {
            let files = spec.files.clone();
            let bundle = tokio::task::spawn_blocking(move || archive::pack_files(&files))
                .await
                .map_err(|e| ContainerError::Archive {
                    path: spec.name.clone(),
                    reason: format!("packing task failed: {e}"),
                })??;
            self.docker
                .upload_archive(&service.container_id, "/", bundle)
                .await?;
        }

        self.docker.start_container(&service.container_id).await?;
        metrics::counter!(
            m::SERVICES_STARTED_TOTAL,
            m::LABEL_SERVICE => role.as_str()
        )
        .increment(1);
        info!(
            service = %service.name,
            role = %role,
            container_id = %service.container_id,
            alias = %service.alias,
            "container started"
        );
        Ok(service)
    }

    /// Starts independent services concurrently.
    ///
    /// Every start runs to completion; whatever each one created is appended
    /// to `stack` in input order. All failures are returned together.
    pub async fn start_all(
        &self,
        specs: &[ServiceSpec],
        role: ServiceRole,
        network: &NetworkHandle,
        stack: &mut ResourceStack,
    ) -> Result<Vec<StartedService>, ContainerError> {
        let results = join_all(specs.iter().map(|spec| async move {
            let mut local = ResourceStack::new();
            let result = self.start(spec, role, network, &mut local).await;
            (local, result)
        }))
        .await;

        let mut started = Vec::with_capacity(specs.len());
        let mut failures = Vec::new();
        for (spec, (local, result)) in specs.iter().zip(results) {
            stack.absorb(local);
            match result {
                Ok(service) => started.push(service),
                Err(e) => {
                    warn!(service = %spec.name, error = %e, "service failed to start");
                    failures.push(e);
                }
            }
        }

        match ContainerError::aggregate(failures) {
            Some(err) => Err(err),
            None => Ok(started),
        }
    }
}

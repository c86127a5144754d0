//! Acquired-resource stack and the Teardown Coordinator.
//!
//! Every network and container is pushed onto a [`ResourceStack`] the moment
//! it exists on the platform. [`TeardownCoordinator::teardown`] is the one
//! unwind routine: it walks the stack newest-first, stops each resource
//! exactly once and keeps going past failures.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use testbed_core::metrics as m;

use crate::docker::DockerClient;
use crate::error::ContainerError;
use crate::network::NetworkHandle;
use crate::provision::StartedService;

/// Upper bound for releasing a single resource.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Something acquired during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Network(NetworkHandle),
    Container(StartedService),
}

impl Resource {
    /// Stable label used in logs and reports (`container:<name>`, `network:<name>`).
    pub fn label(&self) -> String {
        match self {
            Self::Network(net) => format!("network:{}", net.name),
            Self::Container(svc) => format!("container:{}", svc.name),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Container(_) => "container",
        }
    }
}

/// Append-only, acquisition-ordered list of resources.
#[derive(Debug, Default)]
pub struct ResourceStack {
    items: Vec<Resource>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_network(&mut self, network: NetworkHandle) {
        self.items.push(Resource::Network(network));
    }

    pub fn push_container(&mut self, service: StartedService) {
        self.items.push(Resource::Container(service));
    }

    /// Appends everything `other` acquired, preserving its order.
    pub fn absorb(&mut self, other: ResourceStack) {
        self.items.extend(other.items);
    }

    /// Resources in acquisition order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        self.items.iter().map(Resource::label).collect()
    }
}

/// What teardown did.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Every resource a stop was attempted on, in teardown order
    pub attempted: Vec<String>,
    /// Resources released successfully, in teardown order
    pub released: Vec<String>,
    /// One entry per resource that could not be released
    pub failures: Vec<ContainerError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Releases a [`ResourceStack`] in reverse acquisition order.
pub struct TeardownCoordinator<D: DockerClient> {
    docker: Arc<D>,
    stop_timeout: Duration,
}

impl<D: DockerClient> TeardownCoordinator<D> {
    pub fn new(docker: Arc<D>) -> Self {
        Self {
            docker,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Stops every resource newest-first.
    ///
    /// Never fails: per-resource problems are logged and collected in the
    /// report.
    pub async fn teardown(&self, stack: ResourceStack) -> TeardownReport {
        let mut report = TeardownReport::default();
        info!(resources = stack.len(), "tearing down");

        for resource in stack.items.into_iter().rev() {
            let label = resource.label();
            report.attempted.push(label.clone());

            let result = match tokio::time::timeout(self.stop_timeout, self.release(&resource)).await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(ContainerError::Teardown {
                    resource: label.clone(),
                    reason: format!("timed out after {}s", self.stop_timeout.as_secs()),
                }),
            };

            let outcome = if result.is_ok() { "success" } else { "failure" };
            metrics::counter!(
                m::TEARDOWN_RELEASES_TOTAL,
                m::LABEL_RESOURCE => resource.kind(),
                m::LABEL_RESULT => outcome
            )
            .increment(1);

            match result {
                Ok(()) => {
                    info!(resource = %label, "released");
                    report.released.push(label);
                }
                Err(e) => {
                    warn!(resource = %label, error = %e, "failed to release resource");
                    let err = match e {
                        e @ ContainerError::Teardown { .. } => e,
                        other => ContainerError::Teardown {
                            resource: label,
                            reason: other.to_string(),
                        },
                    };
                    report.failures.push(err);
                }
            }
        }

        if !report.is_clean() {
            warn!(
                failed = report.failures.len(),
                released = report.released.len(),
                "teardown finished with failures"
            );
        }
        report
    }

    async fn release(&self, resource: &Resource) -> Result<(), ContainerError> {
        match resource {
            Resource::Network(net) => self.docker.remove_network(&net.id).await,
            Resource::Container(svc) => self.docker.stop_container(&svc.container_id).await,
        }
    }
}

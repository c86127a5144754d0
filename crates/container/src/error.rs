//! Container-layer error types.
//!
//! [`ContainerError`] covers every failure inside this crate. Fatal kinds
//! convert into [`TestbedError`] so the orchestrator can propagate them with
//! `?`; [`ContainerError::Collection`] and [`ContainerError::Teardown`] are
//! diagnostic only and are never escalated.

use testbed_core::error::{ConfigError, ProvisionError, TestbedError};

/// Container-layer error.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Docker API call failed
    #[error("docker api error: {0}")]
    DockerApi(String),

    /// Could not connect to the Docker daemon
    #[error("docker connection error: {0}")]
    DockerConnection(String),

    /// Container does not exist (already removed)
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Health check exhausted its retries
    #[error("service '{service}' did not become ready: {last_error}")]
    StartupTimeout {
        /// Service name
        service: String,
        /// Failure reported by the last probe
        last_error: String,
    },

    /// Database bootstrap step failed
    #[error("database bootstrap failed at '{step}': {cause}")]
    Bootstrap {
        /// Step description (`create user alice`)
        step: String,
        /// Failure reason
        cause: String,
    },

    /// Exec could not be run (distinct from a non-zero exit code)
    #[error("exec failed in container '{container_id}': {reason}")]
    Exec {
        /// Target container
        container_id: String,
        /// Failure reason
        reason: String,
    },

    /// Test runner container could not be created or started
    #[error("test runner unavailable: {0}")]
    RunnerUnavailable(String),

    /// Local archive could not be built
    #[error("archive error: {path}: {reason}")]
    Archive {
        /// Host path involved
        path: String,
        /// Failure reason
        reason: String,
    },

    /// Artifact extraction failed (never fatal)
    #[error("artifact collection failed: {0}")]
    Collection(String),

    /// Resource could not be released (never fatal)
    #[error("teardown of '{resource}' failed: {reason}")]
    Teardown {
        /// Resource label
        resource: String,
        /// Failure reason
        reason: String,
    },

    /// Invalid input handed to this crate
    #[error("config error: {field}: {reason}")]
    Config {
        /// Field name
        field: String,
        /// Failure reason
        reason: String,
    },

    /// Several independent operations failed
    #[error("{} operations failed: {}", .0.len(), join(.0))]
    Aggregate(Vec<ContainerError>),
}

impl ContainerError {
    /// Whether this error aborts the run.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Collection(_) | Self::Teardown { .. } => false,
            Self::Aggregate(errors) => errors.iter().any(Self::is_fatal),
            _ => true,
        }
    }

    /// Collapses a list of sibling failures into one error.
    ///
    /// Returns `None` for an empty list.
    pub fn aggregate(mut errors: Vec<ContainerError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(errors)),
        }
    }
}

impl From<ConfigError> for ContainerError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidValue { field, reason } => Self::Config { field, reason },
            other => Self::Config {
                field: "config".to_owned(),
                reason: other.to_string(),
            },
        }
    }
}

fn join(errors: &[ContainerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ContainerError> for TestbedError {
    fn from(err: ContainerError) -> Self {
        let provision = match err {
            ContainerError::StartupTimeout {
                service,
                last_error,
            } => ProvisionError::StartupTimeout {
                service,
                last_error,
            },
            ContainerError::Bootstrap { step, cause } => ProvisionError::Bootstrap { step, cause },
            ContainerError::RunnerUnavailable(reason) => ProvisionError::RunnerUnavailable(reason),
            ContainerError::Exec { .. } => ProvisionError::Execution(err.to_string()),
            ContainerError::Config { field, reason } => {
                return TestbedError::Config(ConfigError::InvalidValue { field, reason });
            }
            ContainerError::Aggregate(mut errors) if !errors.is_empty() => {
                // The first failure decides the kind; the rest were logged
                // where they happened.
                return errors.remove(0).into();
            }
            other => ProvisionError::Infrastructure(other.to_string()),
        };
        TestbedError::Provision(provision)
    }
}

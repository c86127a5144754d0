//! Error types -- the run-level failure taxonomy.
//!
//! [`TestbedError`] is what the orchestrator reports. Provisioning failures
//! are grouped under [`ProvisionError`]; every variant there is fatal and
//! aborts the remaining provisioning steps (teardown still runs).
//! Non-fatal failures (artifact collection, per-resource teardown) never
//! reach this type; they are contained in their own component.

/// Top-level testbed error.
#[derive(Debug, thiserror::Error)]
pub enum TestbedError {
    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Fatal provisioning error
    #[error("provision error: {0}")]
    Provision(#[from] ProvisionError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TestbedError {
    /// Short, stable name of the error kind (used as a log/metric label).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Provision(e) => e.kind(),
            Self::Io(_) => "io",
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A value failed validation
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Fatal provisioning errors.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The container platform could not create or start a resource
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// A health check exhausted its retries
    #[error("service '{service}' did not become ready: {last_error}")]
    StartupTimeout { service: String, last_error: String },

    /// Database user/database creation failed
    #[error("database bootstrap failed at '{step}': {cause}")]
    Bootstrap { step: String, cause: String },

    /// The test runner container could not be created or started
    #[error("test runner unavailable: {0}")]
    RunnerUnavailable(String),

    /// The test command could not be executed (distinct from a non-zero exit)
    #[error("test execution error: {0}")]
    Execution(String),
}

impl ProvisionError {
    /// Short, stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Infrastructure(_) => "infrastructure",
            Self::StartupTimeout { .. } => "startup_timeout",
            Self::Bootstrap { .. } => "bootstrap",
            Self::RunnerUnavailable(_) => "runner_unavailable",
            Self::Execution(_) => "execution",
        }
    }
}

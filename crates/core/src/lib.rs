#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod metrics;
pub mod mock;
pub mod types;

// --- Re-exports ---

// Errors
pub use error::{ConfigError, ProvisionError, TestbedError};

// Configuration
pub use config::{
    AppContainerConfig, ConfigFormat, DatabaseConfig, GeneralConfig, HealthCheckConfig,
    KeycloakConfig, RunConfig, RunnerConfig,
};

// Network mocks
pub use mock::{MockRegistry, MockResponse, MockRule};

// Domain types
pub use types::{
    ArtifactBundle, DatabaseBootstrapSpec, DatabaseSpec, FileCopy, HealthCheckPolicy,
    RealmImport, ServiceSpec, TestOutcome, UserSpec,
};

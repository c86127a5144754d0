#![doc = include_str!("../README.md")]
//!
//! # Module Structure
//!
//! - [`error`]: Crate error type (`ContainerError`)
//! - [`docker`]: Docker API abstraction (`DockerClient` trait, `BollardDockerClient`)
//! - [`archive`]: Tar packing/unpacking for container copies
//! - [`network`]: Per-run network (`NetworkManager`, `NetworkHandle`)
//! - [`health`]: Readiness polling (`HealthCheckPoller`)
//! - [`provision`]: Generic, database and identity provisioners
//! - [`runner`]: Test runner container and exec (`TestRunner`)
//! - [`artifact`]: Artifact extraction (`ArtifactCollector`)
//! - [`teardown`]: Acquired resources and reverse release (`ResourceStack`, `TeardownCoordinator`)
//!
//! # Architecture
//!
//! ```text
//! NetworkManager.create() ──► ResourceStack
//!        │                        ▲
//!        ▼                        │ push on create
//! DatabaseProvisioner ─┐          │
//! IdentityProvisioner ─┼─► ServiceProvisioner ──► HealthCheckPoller
//! app containers ──────┘          │
//!        │                        │
//!        ▼                        │
//! TestRunner.start/execute ───────┘
//!        │
//!        ▼
//! ArtifactCollector.collect()
//!        │
//!        ▼
//! TeardownCoordinator.teardown(stack)   (newest first)
//! ```

pub mod archive;
pub mod artifact;
pub mod docker;
pub mod error;
pub mod health;
pub mod network;
pub mod provision;
pub mod runner;
pub mod teardown;

// --- Public API Re-exports ---

// Error
pub use error::ContainerError;

// Docker API
pub use docker::{BollardDockerClient, DockerClient, ExecOutput};

// Network
pub use network::{NetworkHandle, NetworkManager};

// Readiness
pub use health::{HealthCheckPoller, Readiness};

// Provisioning
pub use provision::{
    DatabaseProvisioner, IdentityProvisioner, ServiceProvisioner, ServiceRole, StartedService,
};

// Test runner & artifacts
pub use artifact::{ArtifactCollector, ArtifactTarget};
pub use runner::{RunnerHandle, TestRunner};

// Teardown
pub use teardown::{Resource, ResourceStack, TeardownCoordinator, TeardownReport};

//! CLI argument definitions for `testbed`.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

use testbed_core::config::{GeneralConfig, RunConfig};
use testbed_core::error::TestbedError;

/// Provisions a disposable test environment, runs the end-to-end suite in it
/// and tears everything down again.
///
/// Exits 0 only when the test command exited 0.
#[derive(Parser, Debug)]
#[command(name = "testbed")]
#[command(version, about, long_about = None)]
pub struct TestbedCli {
    /// Path to the run configuration (JSON, or TOML by extension).
    #[arg(short, long, default_value = "e2e/cypress/fixtures/config.json")]
    pub config: PathBuf,

    /// Workspace copied into the test runner; relative paths in the
    /// configuration resolve against it.
    #[arg(short, long, default_value = ".")]
    pub workspace: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Docker socket path (defaults to the platform's local socket).
    #[arg(long)]
    pub docker_socket: Option<String>,

    /// Validate the configuration and exit without touching Docker.
    #[arg(long)]
    pub validate: bool,
}

impl TestbedCli {
    /// Loads the configuration: file, then environment, then command line.
    /// Validation runs once, on the merged result.
    pub async fn load_config(&self) -> Result<RunConfig, TestbedError> {
        let mut config = RunConfig::from_file(&self.config).await?;
        config.apply_env_overrides();
        self.apply_overrides(&mut config.general);
        config.validate()?;
        Ok(config)
    }

    /// Applies command-line overrides on top of file and environment values.
    pub fn apply_overrides(&self, general: &mut GeneralConfig) {
        if let Some(level) = &self.log_level {
            general.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            general.log_format = format.clone();
        }
        if let Some(socket) = &self.docker_socket {
            general.docker_socket = socket.clone();
        }
    }
}

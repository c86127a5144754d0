//! Domain types shared by the provisioners, the runner and the orchestrator.
//!
//! Everything here is plain data. Specs are produced from the run
//! configuration and are never mutated once handed to a provisioner.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Readiness probe policy.
///
/// Invariants (enforced by [`HealthCheckPolicy::new`]): `retries >= 1`,
/// `interval > 0`, `timeout > 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    /// Probe command (argv) executed inside the container
    pub command: Vec<String>,
    /// Delay between consecutive probes
    pub interval: Duration,
    /// Upper bound for a single probe
    pub timeout: Duration,
    /// Maximum number of probe attempts
    pub retries: u32,
}

impl HealthCheckPolicy {
    /// Creates a validated policy.
    pub fn new(
        command: Vec<String>,
        interval: Duration,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self, ConfigError> {
        if command.is_empty() {
            return Err(invalid("healthCheck.command", "must not be empty"));
        }
        if retries == 0 {
            return Err(invalid("healthCheck.retries", "must be at least 1"));
        }
        if interval.is_zero() {
            return Err(invalid("healthCheck.interval", "must be greater than 0"));
        }
        if timeout.is_zero() {
            return Err(invalid("healthCheck.timeout", "must be greater than 0"));
        }
        Ok(Self {
            command,
            interval,
            timeout,
            retries,
        })
    }

    /// Creates a validated policy whose probe is a shell snippet (`sh -c`).
    pub fn shell(
        script: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self, ConfigError> {
        Self::new(
            vec!["sh".to_owned(), "-c".to_owned(), script.into()],
            interval,
            timeout,
            retries,
        )
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}

/// A local file copied into a container before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCopy {
    /// Path on the host
    pub source: PathBuf,
    /// Absolute path inside the container
    pub target: String,
}

/// Immutable description of a container to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Logical (and container) name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Network alias other services use to reach this one
    pub alias: String,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Exposed container ports (TCP)
    pub ports: Vec<u16>,
    /// Readiness policy; `None` means "running is ready"
    pub health_check: Option<HealthCheckPolicy>,
    /// Command override
    pub command: Option<Vec<String>>,
    /// Entrypoint override
    pub entrypoint: Option<Vec<String>>,
    /// Working directory override
    pub working_dir: Option<String>,
    /// Files copied in at create time
    pub files: Vec<FileCopy>,
}

impl ServiceSpec {
    /// Creates a spec with no env, ports, health check or overrides.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            alias: alias.into(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            health_check: None,
            command: None,
            entrypoint: None,
            working_dir: None,
            files: Vec::new(),
        }
    }

    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self
    }

    pub fn with_health_check(mut self, policy: HealthCheckPolicy) -> Self {
        self.health_check = Some(policy);
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_file(mut self, source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        self.files.push(FileCopy {
            source: source.into(),
            target: target.into(),
        });
        self
    }
}

/// A database role to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    pub password: String,
}

/// A database to create, owned by `user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub name: String,
    pub user: String,
}

/// Users and databases created once the database container is healthy.
///
/// Applied in listed order: every user first, then every database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseBootstrapSpec {
    pub users: Vec<UserSpec>,
    pub databases: Vec<DatabaseSpec>,
}

impl DatabaseBootstrapSpec {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.databases.is_empty()
    }
}

/// Realm definition imported into the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmImport {
    /// Realm name (also the import file stem)
    pub name: String,
    /// Realm JSON on the host
    pub path: PathBuf,
}

/// Result of the test command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Exit code of the exec; `None` means the platform never reported one
    pub exit_code: Option<i64>,
    /// Combined stdout/stderr
    pub output: String,
}

impl TestOutcome {
    /// Success iff the exit code is exactly 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "no exit code"),
        }
    }
}

/// Artifacts extracted from the test runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    /// Where the archive was written (removed after extraction)
    pub archive_path: PathBuf,
    /// Where the archive was unpacked
    pub extract_dir: PathBuf,
    /// Unpacked entries, relative to `extract_dir`
    pub entries: Vec<PathBuf>,
    /// Archive size in bytes
    pub bytes_written: u64,
}

//! Run configuration -- parsing, environment overrides and validation.
//!
//! [`RunConfig`] mirrors the JSON fixture the end-to-end suite already ships
//! (`e2e/cypress/fixtures/config.json`), so keys are camelCase. A `.toml`
//! file with the same structure is accepted as well.
//!
//! # Loading order
//! 1. CLI arguments (highest priority, applied by the binary)
//! 2. Environment variables (`TESTBED_GENERAL_LOG_LEVEL=debug`)
//! 3. Configuration file
//! 4. Defaults for optional sections (`general`, `runner`)
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), testbed_core::error::TestbedError> {
//! use testbed_core::config::RunConfig;
//!
//! let config = RunConfig::load("e2e/cypress/fixtures/config.json").await?;
//! println!("{} extra containers", config.containers.len());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, TestbedError};
use crate::mock::{MockRegistry, MockRule};
use crate::types::{DatabaseBootstrapSpec, DatabaseSpec, HealthCheckPolicy, RealmImport, UserSpec};

/// Configuration file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Picks the format from the file extension; anything but `.toml` is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}

/// Complete run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Logging and platform settings
    #[serde(default)]
    pub general: GeneralConfig,
    /// Database service
    pub database: DatabaseConfig,
    /// Identity provider service
    pub keycloak: KeycloakConfig,
    /// Primary application container
    pub shell: AppContainerConfig,
    /// Remaining application containers
    #[serde(default)]
    pub containers: Vec<AppContainerConfig>,
    /// Request interception rules consumed by the test runner
    #[serde(default)]
    pub mocks: Vec<MockRule>,
    /// Test runner container
    #[serde(default)]
    pub runner: RunnerConfig,
}

impl RunConfig {
    /// Loads the file, applies environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, TestbedError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads the file without environment overrides or validation.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, TestbedError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TestbedError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                TestbedError::Io(e)
            }
        })?;
        Ok(Self::parse(&content, ConfigFormat::from_path(path))?)
    }

    /// Parses configuration text in the given format.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| {
                ConfigError::ParseFailed {
                    reason: e.to_string(),
                }
            }),
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| ConfigError::ParseFailed {
                reason: e.to_string(),
            }),
        }
    }

    /// Overrides scalar settings from `TESTBED_{SECTION}_{FIELD}` variables.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "TESTBED_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "TESTBED_GENERAL_LOG_FORMAT");
        override_string(
            &mut self.general.docker_socket,
            "TESTBED_GENERAL_DOCKER_SOCKET",
        );
        override_string(
            &mut self.general.network_prefix,
            "TESTBED_GENERAL_NETWORK_PREFIX",
        );

        override_string(&mut self.database.image, "TESTBED_DATABASE_IMAGE");
        override_string(&mut self.keycloak.image, "TESTBED_KEYCLOAK_IMAGE");
        override_u64(
            &mut self.keycloak.startup_timeout,
            "TESTBED_KEYCLOAK_STARTUP_TIMEOUT",
        );
        override_string(&mut self.shell.image, "TESTBED_SHELL_IMAGE");
        override_string(&mut self.runner.image, "TESTBED_RUNNER_IMAGE");
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.logLevel",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.logFormat",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.general.network_prefix.is_empty() {
            return Err(invalid("general.networkPrefix", "must not be empty"));
        }

        self.validate_identities()?;

        self.database.health_check.to_policy("database.healthCheck")?;
        self.validate_bootstrap()?;

        if self.keycloak.realms.is_empty() {
            return Err(invalid("keycloak.realms", "at least one realm is required"));
        }
        if !is_realm_name(&self.keycloak.admin_realm) {
            return Err(invalid(
                "keycloak.adminRealm",
                "must be a non-empty name of [A-Za-z0-9._-]",
            ));
        }
        let mut realms = HashSet::new();
        for realm in &self.keycloak.realms {
            // The name ends up in a health check command and a file name.
            if !is_realm_name(&realm.name) {
                return Err(invalid(
                    "keycloak.realms.name",
                    format!("'{}' must be a non-empty name of [A-Za-z0-9._-]", realm.name),
                ));
            }
            if !realms.insert(realm.name.as_str()) {
                return Err(invalid(
                    "keycloak.realms",
                    format!("duplicate realm '{}'", realm.name),
                ));
            }
        }
        self.keycloak.probe_policy()?;

        if let Some(hc) = &self.shell.health_check {
            hc.to_policy("shell.healthCheck")?;
        }
        for (i, container) in self.containers.iter().enumerate() {
            if let Some(hc) = &container.health_check {
                hc.to_policy(&format!("containers[{i}].healthCheck"))?;
            }
        }

        if self.runner.command.is_empty() {
            return Err(invalid("runner.command", "must not be empty"));
        }
        if self.runner.workdir.is_empty() || self.runner.artifacts_path.is_empty() {
            return Err(invalid(
                "runner",
                "workdir and artifactsPath must not be empty",
            ));
        }

        MockRegistry::new(self.mocks.clone())?;

        Ok(())
    }

    /// Image/name/alias presence and uniqueness across all services.
    fn validate_identities(&self) -> Result<(), ConfigError> {
        let mut services: Vec<(String, &str, &str, &str)> = vec![
            (
                "database".to_owned(),
                self.database.image.as_str(),
                self.database.name.as_str(),
                self.database.alias.as_str(),
            ),
            (
                "keycloak".to_owned(),
                self.keycloak.image.as_str(),
                self.keycloak.name.as_str(),
                self.keycloak.alias.as_str(),
            ),
            (
                "shell".to_owned(),
                self.shell.image.as_str(),
                self.shell.name.as_str(),
                self.shell.alias.as_str(),
            ),
        ];
        for (i, c) in self.containers.iter().enumerate() {
            services.push((
                format!("containers[{i}]"),
                c.image.as_str(),
                c.name.as_str(),
                c.alias.as_str(),
            ));
        }

        let mut names = HashSet::new();
        let mut aliases = HashSet::new();
        for (section, image, name, alias) in services {
            if image.is_empty() {
                return Err(invalid(&format!("{section}.image"), "must not be empty"));
            }
            if name.is_empty() {
                return Err(invalid(&format!("{section}.name"), "must not be empty"));
            }
            if alias.is_empty() {
                return Err(invalid(&format!("{section}.alias"), "must not be empty"));
            }
            if !names.insert(name) {
                return Err(invalid(
                    &format!("{section}.name"),
                    format!("duplicate container name '{name}'"),
                ));
            }
            if !aliases.insert(alias) {
                return Err(invalid(
                    &format!("{section}.alias"),
                    format!("duplicate network alias '{alias}'"),
                ));
            }
        }
        Ok(())
    }

    fn validate_bootstrap(&self) -> Result<(), ConfigError> {
        let mut known: HashSet<&str> = HashSet::new();
        known.insert(self.database.username.as_str());
        for user in &self.database.users {
            if user.name.is_empty() {
                return Err(invalid("database.users.name", "must not be empty"));
            }
            known.insert(user.name.as_str());
        }
        for db in &self.database.databases {
            if db.name.is_empty() {
                return Err(invalid("database.databases.name", "must not be empty"));
            }
            if !known.contains(db.user.as_str()) {
                return Err(invalid(
                    "database.databases.user",
                    format!("database '{}' is owned by unknown user '{}'", db.name, db.user),
                ));
            }
        }
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (json, pretty)
    pub log_format: String,
    /// Prefix of the per-run network name
    pub network_prefix: String,
    /// Docker socket path; empty means the platform default
    pub docker_socket: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
            network_prefix: "testbed".to_owned(),
            docker_socket: String::new(),
        }
    }
}

/// Health check settings as written in the configuration (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Shell snippet run with `sh -c`
    pub command: String,
    /// Interval between probes (ms)
    pub interval: u64,
    /// Timeout of a single probe (ms)
    pub timeout: u64,
    /// Maximum probe attempts
    pub retries: u32,
}

impl HealthCheckConfig {
    /// Converts into a validated policy; `field` prefixes error messages.
    pub fn to_policy(&self, field: &str) -> Result<HealthCheckPolicy, ConfigError> {
        HealthCheckPolicy::shell(
            self.command.clone(),
            Duration::from_millis(self.interval),
            Duration::from_millis(self.timeout),
            self.retries,
        )
        .map_err(|e| prefix_field(e, field))
    }
}

/// Database service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub image: String,
    pub name: String,
    pub alias: String,
    /// Database created by the image entrypoint
    pub database_name: String,
    /// Superuser created by the image entrypoint
    pub username: String,
    pub password: String,
    pub port: u16,
    pub health_check: HealthCheckConfig,
    /// Roles created after startup
    #[serde(default)]
    pub users: Vec<UserSpec>,
    /// Databases created after startup
    #[serde(default)]
    pub databases: Vec<DatabaseSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl DatabaseConfig {
    pub fn bootstrap_spec(&self) -> DatabaseBootstrapSpec {
        DatabaseBootstrapSpec {
            users: self.users.clone(),
            databases: self.databases.clone(),
        }
    }
}

/// Identity provider service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeycloakConfig {
    pub image: String,
    pub name: String,
    pub alias: String,
    /// Realm the admin credentials belong to (usually `master`)
    pub admin_realm: String,
    pub admin_username: String,
    pub admin_password: String,
    /// Container command (e.g. `["start-dev", "--import-realm"]`)
    #[serde(default)]
    pub command: Vec<String>,
    /// Upper bound for the whole readiness wait (ms); 0 disables it
    #[serde(default)]
    pub startup_timeout: u64,
    pub port: u16,
    pub realms: Vec<RealmImport>,
    /// Interval between probes (ms)
    pub interval: u64,
    /// Timeout of a single probe (ms)
    pub timeout: u64,
    /// Maximum probe attempts
    pub retries: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl KeycloakConfig {
    /// Readiness policy with a placeholder command; the provisioner fills in
    /// the composite per-realm probe.
    pub fn probe_policy(&self) -> Result<HealthCheckPolicy, ConfigError> {
        HealthCheckPolicy::shell(
            "true",
            Duration::from_millis(self.interval),
            Duration::from_millis(self.timeout),
            self.retries,
        )
        .map_err(|e| prefix_field(e, "keycloak"))
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        (self.startup_timeout > 0).then(|| Duration::from_millis(self.startup_timeout))
    }
}

/// Application container (the shell or one of `containers`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppContainerConfig {
    pub image: String,
    pub name: String,
    pub alias: String,
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Optional readiness gate
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

/// Test runner container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunnerConfig {
    pub image: String,
    /// Where the workspace is copied and the command runs
    pub workdir: String,
    /// Test command (argv)
    pub command: Vec<String>,
    /// Directory inside the container that holds screenshots/videos
    pub artifacts_path: String,
    /// Local archive path, relative to the workspace
    pub archive_path: String,
    /// Local extraction directory, relative to the workspace
    pub extract_dir: String,
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image: "cypress/included:13.17.0".to_owned(),
            workdir: "/e2e".to_owned(),
            command: vec![
                "cypress".to_owned(),
                "run".to_owned(),
                "--headed".to_owned(),
            ],
            artifacts_path: "/e2e/e2e/cypress/screenshots".to_owned(),
            archive_path: "e2e/cypress/screenshots.tar".to_owned(),
            extract_dir: "e2e/cypress/container-screenshots".to_owned(),
            env: BTreeMap::new(),
        }
    }
}

/// `true` for names usable as a realm: `[A-Za-z0-9._-]+`, not only dots.
pub fn is_realm_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().all(|c| c == '.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

fn prefix_field(err: ConfigError, prefix: &str) -> ConfigError {
    match err {
        ConfigError::InvalidValue { field, reason } => {
            let field = field.strip_prefix("healthCheck.").unwrap_or(&field);
            ConfigError::InvalidValue {
                field: format!("{prefix}.{field}"),
                reason,
            }
        }
        other => other,
    }
}

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

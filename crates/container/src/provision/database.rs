//! Database provisioner -- Postgres container plus user/database bootstrap.

use std::sync::Arc;

use tracing::info;

use testbed_core::config::DatabaseConfig;
use testbed_core::types::{DatabaseBootstrapSpec, ServiceSpec};

use super::{ServiceProvisioner, ServiceRole, StartedService};
use crate::docker::DockerClient;
use crate::error::ContainerError;
use crate::network::NetworkHandle;
use crate::teardown::ResourceStack;

/// Builds the database container spec from configuration.
pub fn service_spec(config: &DatabaseConfig) -> Result<ServiceSpec, ContainerError> {
    let policy = config.health_check.to_policy("database.healthCheck")?;
    Ok(
        ServiceSpec::new(&config.name, &config.image, &config.alias)
            .with_env([
                ("POSTGRES_DB", config.database_name.as_str()),
                ("POSTGRES_USER", config.username.as_str()),
                ("POSTGRES_PASSWORD", config.password.as_str()),
            ])
            .with_env(config.env.clone())
            .with_port(config.port)
            .with_health_check(policy),
    )
}

/// A single bootstrap statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStep {
    /// `create user <name>` / `create database <name>`
    pub label: String,
    pub sql: String,
}

/// Bootstrap statements in execution order: users, then databases.
pub fn bootstrap_steps(spec: &DatabaseBootstrapSpec) -> Vec<BootstrapStep> {
    let users = spec.users.iter().map(|user| BootstrapStep {
        label: format!("create user {}", user.name),
        sql: format!(
            "CREATE USER {} WITH ENCRYPTED PASSWORD {}",
            quote_ident(&user.name),
            quote_literal(&user.password)
        ),
    });
    let databases = spec.databases.iter().map(|db| BootstrapStep {
        label: format!("create database {}", db.name),
        sql: format!(
            "CREATE DATABASE {} WITH OWNER {}",
            quote_ident(&db.name),
            quote_ident(&db.user)
        ),
    });
    users.chain(databases).collect()
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

/// Starts the database and applies its bootstrap.
pub struct DatabaseProvisioner<D: DockerClient> {
    docker: Arc<D>,
    provisioner: ServiceProvisioner<D>,
}

impl<D: DockerClient> DatabaseProvisioner<D> {
    pub fn new(docker: Arc<D>) -> Self {
        Self {
            provisioner: ServiceProvisioner::new(Arc::clone(&docker)),
            docker,
        }
    }

    /// Starts the container, waits for health, then bootstraps.
    ///
    /// The container is on `stack` before the bootstrap begins.
    pub async fn start(
        &self,
        config: &DatabaseConfig,
        network: &NetworkHandle,
        stack: &mut ResourceStack,
    ) -> Result<StartedService, ContainerError> {
        let spec = service_spec(config)?;
        let service = self
            .provisioner
            .start(&spec, ServiceRole::Database, network, stack)
            .await?;
        self.bootstrap(&service, config).await?;
        Ok(service)
    }

    /// Runs every bootstrap step in order; stops at the first failure.
    pub async fn bootstrap(
        &self,
        service: &StartedService,
        config: &DatabaseConfig,
    ) -> Result<(), ContainerError> {
        let steps = bootstrap_steps(&config.bootstrap_spec());
        for step in &steps {
            let cmd = vec![
                "psql".to_owned(),
                "-v".to_owned(),
                "ON_ERROR_STOP=1".to_owned(),
                "-U".to_owned(),
                config.username.clone(),
                "-d".to_owned(),
                config.database_name.clone(),
                "-c".to_owned(),
                step.sql.clone(),
            ];

            let out = self
                .docker
                .exec(&service.container_id, &cmd)
                .await
                .map_err(|e| ContainerError::Bootstrap {
                    step: step.label.clone(),
                    cause: e.to_string(),
                })?;

            if !out.success() {
                return Err(ContainerError::Bootstrap {
                    step: step.label.clone(),
                    cause: match out.exit_code {
                        Some(code) => format!("psql exited with {code}: {}", out.output.trim()),
                        None => "psql reported no exit code".to_owned(),
                    },
                });
            }
            info!(service = %service.name, step = %step.label, "bootstrap step applied");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use testbed_core::config::HealthCheckConfig;
    use testbed_core::types::{DatabaseSpec, UserSpec};

    use super::*;
    use crate::docker::{ExecOutput, MockDockerClient};

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            image: "docker.io/library/postgres:13.4".to_owned(),
            name: "e2e-postgres".to_owned(),
            alias: "postgresdb".to_owned(),
            database_name: "postgres".to_owned(),
            username: "postgres".to_owned(),
            password: "admin".to_owned(),
            port: 5432,
            health_check: HealthCheckConfig {
                command: "pg_isready -U postgres".to_owned(),
                interval: 1000,
                timeout: 1000,
                retries: 3,
            },
            users: vec![
                UserSpec {
                    name: "keycloak".to_owned(),
                    password: "keycloak".to_owned(),
                },
                UserSpec {
                    name: "onecx_tenant".to_owned(),
                    password: "it's".to_owned(),
                },
            ],
            databases: vec![DatabaseSpec {
                name: "keycloak".to_owned(),
                user: "keycloak".to_owned(),
            }],
            env: BTreeMap::new(),
        }
    }

    fn network() -> NetworkHandle {
        NetworkHandle {
            id: "net-1".to_owned(),
            name: "testbed-1".to_owned(),
        }
    }

    /// Last argv element of every exec sent to the database container.
    fn sql_of(docker: &MockDockerClient) -> Vec<String> {
        docker
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                crate::docker::MockCall::Exec { cmd, .. } if cmd[0] == "psql" => cmd.last().cloned(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn spec_carries_postgres_env_and_policy() {
        let spec = service_spec(&config()).unwrap();
        assert_eq!(spec.env["POSTGRES_DB"], "postgres");
        assert_eq!(spec.env["POSTGRES_USER"], "postgres");
        assert_eq!(spec.env["POSTGRES_PASSWORD"], "admin");
        assert_eq!(spec.ports, vec![5432]);
        assert_eq!(spec.health_check.unwrap().retries, 3);
    }

    #[test]
    fn steps_are_users_then_databases() {
        let steps = bootstrap_steps(&config().bootstrap_spec());
        let labels: Vec<_> = steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "create user keycloak",
                "create user onecx_tenant",
                "create database keycloak"
            ]
        );
        assert_eq!(
            steps[1].sql,
            "CREATE USER \"onecx_tenant\" WITH ENCRYPTED PASSWORD 'it''s'"
        );
        assert_eq!(
            steps[2].sql,
            "CREATE DATABASE \"keycloak\" WITH OWNER \"keycloak\""
        );
    }

    #[test]
    fn identifiers_escape_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[tokio::test(start_paused = true)]
    async fn start_bootstraps_after_health() {
        let docker = Arc::new(MockDockerClient::new());
        let provisioner = DatabaseProvisioner::new(Arc::clone(&docker));
        let mut stack = ResourceStack::new();

        provisioner
            .start(&config(), &network(), &mut stack)
            .await
            .unwrap();

        // one probe, then three statements
        assert_eq!(docker.exec_count("e2e-postgres"), 4);
        assert_eq!(sql_of(&docker).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_step_aborts_and_keeps_container() {
        let docker = Arc::new(MockDockerClient::new().with_exec(|_, cmd| {
            let failed = cmd.last().is_some_and(|sql| sql.contains("onecx_tenant"));
            Ok(ExecOutput {
                exit_code: Some(if failed { 1 } else { 0 }),
                output: if failed {
                    "ERROR: role exists".to_owned()
                } else {
                    String::new()
                },
            })
        }));
        let provisioner = DatabaseProvisioner::new(Arc::clone(&docker));
        let mut stack = ResourceStack::new();

        let err = provisioner
            .start(&config(), &network(), &mut stack)
            .await
            .unwrap_err();

        match err {
            ContainerError::Bootstrap { step, cause } => {
                assert_eq!(step, "create user onecx_tenant");
                assert!(cause.contains("role exists"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stack.labels(), vec!["container:e2e-postgres"]);
        // the database step never ran
        assert_eq!(sql_of(&docker).len(), 2);
    }
}

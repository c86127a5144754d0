//! Orchestrator integration tests.
//!
//! Tests the full flow against a scripted Docker client:
//! provisioning -> test exec -> artifact collection -> reverse teardown.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::Mutex;

use testbed_cli::orchestrator::{Orchestrator, RunReport};
use testbed_container::{ContainerError, DockerClient, ExecOutput};
use testbed_core::config::{ConfigFormat, HealthCheckConfig, RunConfig};
use testbed_core::types::ServiceSpec;

const EXAMPLE: &str = include_str!("../../testbed.example.json");

mod mock {
    use super::*;

    /// Scripted Docker client. Containers are addressed by name (`id-<name>`).
    #[derive(Default)]
    pub struct TestDockerClient {
        pub events: Mutex<Vec<String>>,
        /// Containers whose health probes always fail
        pub unhealthy: HashSet<String>,
        /// Containers whose create call fails
        pub fail_create: HashSet<String>,
        /// Containers whose stop call fails
        pub fail_stop: HashSet<String>,
        /// Fail network creation
        pub fail_network: bool,
        /// Exit code of the test command
        pub runner_exit: i64,
        /// Fail the test exec at the API level
        pub runner_exec_error: bool,
        /// Artifact archive; `None` simulates a broken stream
        pub archive: Option<Vec<u8>>,
    }

    impl TestDockerClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events(&self) -> Vec<String> {
            self.events.lock().await.clone()
        }

        pub async fn stops(&self) -> Vec<String> {
            self.events()
                .await
                .into_iter()
                .filter_map(|e| e.strip_prefix("stop ").map(str::to_owned))
                .collect()
        }

        pub async fn probes(&self, name: &str) -> usize {
            let needle = format!("probe {name}");
            self.events()
                .await
                .iter()
                .filter(|e| **e == needle)
                .count()
        }

        async fn push(&self, event: String) {
            self.events.lock().await.push(event);
        }
    }

    fn name_of(id: &str) -> String {
        id.strip_prefix("id-").unwrap_or(id).to_owned()
    }

    fn is_runner(name: &str) -> bool {
        name.ends_with("-runner")
    }

    impl DockerClient for TestDockerClient {
        async fn create_network(&self, name: &str) -> Result<String, ContainerError> {
            if self.fail_network {
                return Err(ContainerError::DockerApi("network pool exhausted".to_owned()));
            }
            self.push("create-network".to_owned()).await;
            Ok(name.to_owned())
        }

        async fn remove_network(&self, _id: &str) -> Result<(), ContainerError> {
            self.push("stop network".to_owned()).await;
            Ok(())
        }

        async fn create_container(
            &self,
            spec: &ServiceSpec,
            _network: &str,
        ) -> Result<String, ContainerError> {
            if self.fail_create.contains(&spec.name) {
                return Err(ContainerError::DockerApi(format!(
                    "no such image: {}",
                    spec.image
                )));
            }
            self.push(format!("create {}", spec.name)).await;
            Ok(format!("id-{}", spec.name))
        }

        async fn upload_archive(
            &self,
            id: &str,
            path: &str,
            _archive: Vec<u8>,
        ) -> Result<(), ContainerError> {
            self.push(format!("upload {} {path}", name_of(id))).await;
            Ok(())
        }

        async fn start_container(&self, id: &str) -> Result<(), ContainerError> {
            self.push(format!("start {}", name_of(id))).await;
            Ok(())
        }

        async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, ContainerError> {
            let name = name_of(id);
            let code = match cmd[0].as_str() {
                "sh" => {
                    self.push(format!("probe {name}")).await;
                    i64::from(self.unhealthy.contains(&name))
                }
                _ if is_runner(&name) => {
                    self.push("test-exec".to_owned()).await;
                    if self.runner_exec_error {
                        return Err(ContainerError::DockerApi("exec connection reset".to_owned()));
                    }
                    self.runner_exit
                }
                other => {
                    self.push(format!("exec {name} {other}")).await;
                    0
                }
            };
            Ok(ExecOutput {
                exit_code: Some(code),
                output: String::new(),
            })
        }

        fn download_archive<'a>(
            &'a self,
            _id: &'a str,
            _path: &'a str,
        ) -> BoxStream<'a, Result<Bytes, ContainerError>> {
            let items = match &self.archive {
                Some(bytes) => vec![Ok(Bytes::from(bytes.clone()))],
                None => vec![Err(ContainerError::Collection(
                    "archive stream reset".to_owned(),
                ))],
            };
            futures_util::stream::iter(items).boxed()
        }

        fn follow_logs<'a>(
            &'a self,
            _id: &'a str,
        ) -> BoxStream<'a, Result<String, ContainerError>> {
            futures_util::stream::iter(vec![Ok("Running: login.cy.ts".to_owned())]).boxed()
        }

        async fn stop_container(&self, id: &str) -> Result<(), ContainerError> {
            let name = name_of(id);
            let label = if is_runner(&name) {
                "runner".to_owned()
            } else {
                name
            };
            self.push(format!("stop {label}")).await;
            if self.fail_stop.contains(&label) {
                return Err(ContainerError::ContainerNotFound(id.to_owned()));
            }
            Ok(())
        }

        async fn ping(&self) -> Result<(), ContainerError> {
            Ok(())
        }
    }
}

use mock::TestDockerClient;

/// Example configuration trimmed to Scenario A: 2 users, 1 database,
/// 1 realm, the shell and no extra containers.
fn scenario_a_config() -> RunConfig {
    let mut config = RunConfig::parse(EXAMPLE, ConfigFormat::Json).expect("example parses");
    config.database.databases.truncate(1);
    config.containers.clear();
    config.keycloak.retries = 5;
    config
}

fn workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let imports = dir.path().join("e2e/imports");
    std::fs::create_dir_all(&imports).expect("imports dir");
    std::fs::write(imports.join("realm-onecx.json"), br#"{"realm":"onecx"}"#).expect("realm");
    dir
}

fn screenshot_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let content = b"png";
    let mut header = tar::Header::new_gnu();
    header.set_path("screenshots/login.cy.ts/failed.png").expect("path");
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, &content[..]).expect("append");
    builder.into_inner().expect("finish")
}

async fn run(
    config: RunConfig,
    docker: TestDockerClient,
    ws: &Path,
) -> (RunReport, Arc<TestDockerClient>) {
    run_with(config, docker, ws).await
}

#[tokio::test(start_paused = true)]
async fn scenario_a_passing_run_tears_down_everything() {
    // Given: a healthy environment and a passing suite
    let ws = workspace();
    let docker = TestDockerClient {
        archive: Some(screenshot_archive()),
        ..TestDockerClient::new()
    };

    // When: running
    let (report, docker) = run(scenario_a_config(), docker, ws.path()).await;

    // Then: exit 0, five resources released newest-first
    assert_eq!(report.exit_code(), 0);
    assert!(report.error.is_none());
    assert_eq!(
        docker.stops().await,
        vec!["runner", "e2e-shell-ui", "e2e-keycloak-app", "e2e-postgres", "network"]
    );
    assert_eq!(report.teardown.released.len(), 5);
    assert!(report.teardown.is_clean());

    // database bootstrapped: two users, one database
    let psql = docker
        .events()
        .await
        .iter()
        .filter(|e| e.starts_with("exec e2e-postgres psql"))
        .count();
    assert_eq!(psql, 3);

    // artifacts landed next to the suite
    let bundle = report
        .collection
        .expect("collection attempted")
        .expect("collection succeeded");
    assert_eq!(bundle.entries.len(), 1);
    assert!(
        ws.path()
            .join("e2e/cypress/container-screenshots/screenshots/login.cy.ts/failed.png")
            .exists()
    );
    assert!(!ws.path().join("e2e/cypress/screenshots.tar").exists());
}

#[tokio::test(start_paused = true)]
async fn scenario_b_identity_provider_never_ready() {
    // Given: keycloak probes always fail
    let ws = workspace();
    let docker = TestDockerClient {
        unhealthy: HashSet::from(["e2e-keycloak-app".to_owned()]),
        ..TestDockerClient::new()
    };

    // When
    let (report, docker) = run(scenario_a_config(), docker, ws.path()).await;

    // Then: startup timeout after exactly `retries` probes
    let err = report.error.as_ref().expect("run aborted");
    assert_eq!(err.kind(), "startup_timeout");
    assert_eq!(docker.probes("e2e-keycloak-app").await, 5);
    assert_eq!(report.exit_code(), 1);
    assert!(report.outcome.is_none());
    assert!(report.collection.is_none());

    // nothing after keycloak was started; what was acquired is released
    let events = docker.events().await;
    assert!(!events.iter().any(|e| e == "create e2e-shell-ui"));
    assert_eq!(
        docker.stops().await,
        vec!["e2e-keycloak-app", "e2e-postgres", "network"]
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_c_failing_suite_with_broken_artifacts() {
    // Given: the suite exits 1 and the archive stream breaks
    let ws = workspace();
    let docker = TestDockerClient {
        runner_exit: 1,
        archive: None,
        ..TestDockerClient::new()
    };

    // When
    let (report, docker) = run(scenario_a_config(), docker, ws.path()).await;

    // Then: exit 1 from the suite, collection attempted and failed
    assert_eq!(report.exit_code(), 1);
    assert!(report.error.is_none());
    assert_eq!(report.outcome.as_ref().and_then(|o| o.exit_code), Some(1));
    assert!(matches!(
        report.collection,
        Some(Err(ContainerError::Collection(_)))
    ));
    assert!(!ws.path().join("e2e/cypress/screenshots.tar").exists());
    assert_eq!(docker.stops().await.first().map(String::as_str), Some("runner"));
}

#[tokio::test(start_paused = true)]
async fn broken_artifacts_never_flip_a_passing_run() {
    let ws = workspace();
    let docker = TestDockerClient {
        archive: None,
        ..TestDockerClient::new()
    };

    let (report, _docker) = run(scenario_a_config(), docker, ws.path()).await;

    assert!(matches!(report.collection, Some(Err(_))));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_extra_containers_are_all_released() {
    // Given: two independent extra containers without health checks
    let ws = workspace();
    let mut config = scenario_a_config();
    let mut first = config.shell.clone();
    first.name = "e2e-tenant-ui".to_owned();
    first.alias = "onecx-tenant-ui".to_owned();
    let mut second = config.shell.clone();
    second.name = "e2e-workspace-ui".to_owned();
    second.alias = "onecx-workspace-ui".to_owned();
    config.containers = vec![first, second];

    // When
    let (report, docker) = run(config, TestDockerClient::new(), ws.path()).await;

    // Then: both acquired and both stopped, before the shell
    assert_eq!(report.exit_code(), 0);
    let stops = docker.stops().await;
    assert_eq!(stops.len(), 6);
    assert_eq!(stops[0], "runner");
    let extras: HashSet<_> = stops[1..3].iter().cloned().collect();
    assert_eq!(
        extras,
        HashSet::from(["e2e-tenant-ui".to_owned(), "e2e-workspace-ui".to_owned()])
    );
    assert_eq!(&stops[3..], ["e2e-shell-ui", "e2e-keycloak-app", "e2e-postgres", "network"]);
}

#[tokio::test(start_paused = true)]
async fn unready_sibling_does_not_leak_the_other() {
    // Given: one extra container with a failing readiness gate
    let ws = workspace();
    let mut config = scenario_a_config();
    let mut healthy = config.shell.clone();
    healthy.name = "e2e-tenant-ui".to_owned();
    healthy.alias = "onecx-tenant-ui".to_owned();
    let mut gated = config.shell.clone();
    gated.name = "e2e-workspace-ui".to_owned();
    gated.alias = "onecx-workspace-ui".to_owned();
    gated.health_check = Some(HealthCheckConfig {
        command: "curl -f http://localhost:8080".to_owned(),
        interval: 500,
        timeout: 500,
        retries: 2,
    });
    config.containers = vec![healthy, gated];
    let docker = TestDockerClient {
        unhealthy: HashSet::from(["e2e-workspace-ui".to_owned()]),
        ..TestDockerClient::new()
    };

    // When
    let (report, docker) = run(config, docker, ws.path()).await;

    // Then: the run aborts before the runner, both siblings are released
    assert_eq!(report.error.as_ref().map(|e| e.kind()), Some("startup_timeout"));
    let stops = docker.stops().await;
    assert!(stops.contains(&"e2e-tenant-ui".to_owned()));
    assert!(stops.contains(&"e2e-workspace-ui".to_owned()));
    assert!(!stops.contains(&"runner".to_owned()));
    assert_eq!(stops.last().map(String::as_str), Some("network"));
}

#[tokio::test(start_paused = true)]
async fn missing_image_aborts_as_infrastructure_failure() {
    let ws = workspace();
    let docker = TestDockerClient {
        fail_create: HashSet::from(["e2e-shell-ui".to_owned()]),
        ..TestDockerClient::new()
    };

    let (report, docker) = run(scenario_a_config(), docker, ws.path()).await;

    assert_eq!(report.error.as_ref().map(|e| e.kind()), Some("infrastructure"));
    // never created, so never stopped
    assert_eq!(
        docker.stops().await,
        vec!["e2e-keycloak-app", "e2e-postgres", "network"]
    );
}

#[tokio::test(start_paused = true)]
async fn exec_failure_is_an_orchestration_error() {
    let ws = workspace();
    let docker = TestDockerClient {
        runner_exec_error: true,
        ..TestDockerClient::new()
    };

    let (report, docker) = run(scenario_a_config(), docker, ws.path()).await;

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.error.as_ref().map(|e| e.kind()), Some("execution"));
    // the runner exists, so collection was still attempted
    assert!(report.collection.is_some());
    assert_eq!(docker.stops().await.first().map(String::as_str), Some("runner"));
}

#[tokio::test(start_paused = true)]
async fn runner_unavailable_is_distinct_from_test_failure() {
    // Given: every service comes up but the runner image cannot be created
    let ws = workspace();
    let docker = FailingRunner(TestDockerClient::new());

    // When
    let (report, docker) = run_with(scenario_a_config(), docker, ws.path()).await;

    // Then: aborted before any test exec, provisioned services still released

    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        report.error.as_ref().map(|e| e.kind()),
        Some("runner_unavailable")
    );
    assert!(report.outcome.is_none());
    assert!(report.collection.is_none());
    assert!(!docker.0.events().await.iter().any(|e| e == "test-exec"));
    assert_eq!(
        docker.0.stops().await,
        vec!["e2e-shell-ui", "e2e-keycloak-app", "e2e-postgres", "network"]
    );
}

#[tokio::test(start_paused = true)]
async fn network_failure_aborts_with_nothing_to_release() {
    let ws = workspace();
    let docker = TestDockerClient {
        fail_network: true,
        ..TestDockerClient::new()
    };

    let (report, docker) = run(scenario_a_config(), docker, ws.path()).await;

    assert_eq!(report.error.as_ref().map(|e| e.kind()), Some("infrastructure"));
    assert!(report.teardown.attempted.is_empty());
    assert!(docker.events().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn teardown_failures_are_isolated_and_do_not_change_exit_code() {
    let ws = workspace();
    let docker = TestDockerClient {
        fail_stop: HashSet::from(["e2e-keycloak-app".to_owned()]),
        archive: Some(screenshot_archive()),
        ..TestDockerClient::new()
    };

    let (report, docker) = run(scenario_a_config(), docker, ws.path()).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.teardown.failures.len(), 1);
    assert_eq!(report.teardown.released.len(), 4);
    assert_eq!(docker.stops().await.len(), 5);
}

#[tokio::test]
async fn invalid_configuration_is_rejected_up_front() {
    let mut config = scenario_a_config();
    config.keycloak.realms.clear();
    let result = Orchestrator::new(config, ".", Arc::new(TestDockerClient::new()));
    assert!(result.is_err());
}

/// Wraps the scripted client so that creating the runner fails.
struct FailingRunner(TestDockerClient);

impl DockerClient for FailingRunner {
    async fn create_network(&self, name: &str) -> Result<String, ContainerError> {
        self.0.create_network(name).await
    }

    async fn remove_network(&self, id: &str) -> Result<(), ContainerError> {
        self.0.remove_network(id).await
    }

    async fn create_container(
        &self,
        spec: &ServiceSpec,
        network: &str,
    ) -> Result<String, ContainerError> {
        if spec.name.ends_with("-runner") {
            return Err(ContainerError::DockerApi(format!(
                "pull access denied for {}",
                spec.image
            )));
        }
        self.0.create_container(spec, network).await
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), ContainerError> {
        self.0.upload_archive(id, path, archive).await
    }

    async fn start_container(&self, id: &str) -> Result<(), ContainerError> {
        self.0.start_container(id).await
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, ContainerError> {
        self.0.exec(id, cmd).await
    }

    fn download_archive<'a>(
        &'a self,
        id: &'a str,
        path: &'a str,
    ) -> BoxStream<'a, Result<Bytes, ContainerError>> {
        self.0.download_archive(id, path)
    }

    fn follow_logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String, ContainerError>> {
        self.0.follow_logs(id)
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerError> {
        self.0.stop_container(id).await
    }

    async fn ping(&self) -> Result<(), ContainerError> {
        self.0.ping().await
    }
}

async fn run_with<D: DockerClient>(
    config: RunConfig,
    docker: D,
    ws: &Path,
) -> (RunReport, Arc<D>) {
    let docker = Arc::new(docker);
    let orchestrator =
        Orchestrator::new(config, ws, Arc::clone(&docker)).expect("valid configuration");
    (orchestrator.run().await, docker)
}

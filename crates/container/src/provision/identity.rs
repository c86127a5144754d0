//! Identity provider provisioner (Keycloak).
//!
//! Realm files are copied into the import directory before the container
//! starts. Readiness is one composite probe: every realm's OpenID discovery
//! document must answer 200, so a single missing realm keeps the service
//! not-ready.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use testbed_core::config::KeycloakConfig;
use testbed_core::types::{HealthCheckPolicy, RealmImport, ServiceSpec};

use super::{ServiceProvisioner, ServiceRole, StartedService};
use crate::docker::DockerClient;
use crate::error::ContainerError;
use crate::network::NetworkHandle;
use crate::teardown::ResourceStack;

/// Keycloak reads realm exports from here on `--import-realm`.
pub const IMPORT_DIR: &str = "/opt/keycloak/data/import";

/// Discovery probe for one realm. Needs only `sh`, `head` and `grep`.
pub fn realm_probe(realm: &str, port: u16) -> String {
    format!(
        "{{ printf >&3 'GET /realms/{realm}/.well-known/openid-configuration HTTP/1.0\\r\\nHost: localhost\\r\\n\\r\\n'; cat <&3; }} 3<>/dev/tcp/localhost/{port} | head -1 | grep 200"
    )
}

/// All realm probes AND-ed together.
pub fn composite_probe(realms: &[RealmImport], port: u16) -> String {
    realms
        .iter()
        .map(|realm| realm_probe(&realm.name, port))
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Builds the identity provider spec. Relative realm paths resolve against
/// `workspace`.
pub fn service_spec(config: &KeycloakConfig, workspace: &Path) -> Result<ServiceSpec, ContainerError> {
    if config.realms.is_empty() {
        return Err(ContainerError::Config {
            field: "keycloak.realms".to_owned(),
            reason: "at least one realm is required".to_owned(),
        });
    }

    let base = config.probe_policy()?;
    let policy = HealthCheckPolicy::shell(
        composite_probe(&config.realms, config.port),
        base.interval,
        base.timeout,
        base.retries,
    )?;

    let mut spec = ServiceSpec::new(&config.name, &config.image, &config.alias)
        .with_env([
            ("KEYCLOAK_ADMIN", config.admin_username.clone()),
            ("KEYCLOAK_ADMIN_PASSWORD", config.admin_password.clone()),
            ("KC_HTTP_PORT", config.port.to_string()),
        ])
        .with_env(config.env.clone())
        .with_port(config.port)
        .with_health_check(policy);

    if !config.command.is_empty() {
        spec = spec.with_command(config.command.clone());
    }

    for realm in &config.realms {
        spec = spec.with_file(
            workspace.join(&realm.path),
            format!("{IMPORT_DIR}/{}.json", realm.name),
        );
    }
    Ok(spec)
}

/// Starts the identity provider.
pub struct IdentityProvisioner<D: DockerClient> {
    provisioner: ServiceProvisioner<D>,
}

impl<D: DockerClient> IdentityProvisioner<D> {
    pub fn new(docker: Arc<D>) -> Self {
        Self {
            provisioner: ServiceProvisioner::new(docker),
        }
    }

    /// Starts Keycloak and waits until every realm answers, bounded by
    /// `startupTimeout` when set.
    pub async fn start(
        &self,
        config: &KeycloakConfig,
        workspace: &Path,
        network: &NetworkHandle,
        stack: &mut ResourceStack,
    ) -> Result<StartedService, ContainerError> {
        let spec = service_spec(config, workspace)?;
        info!(
            service = %config.name,
            admin_realm = %config.admin_realm,
            realms = config.realms.len(),
            "starting identity provider"
        );
        self.provisioner
            .start_bounded(
                &spec,
                ServiceRole::IdentityProvider,
                network,
                stack,
                config.startup_timeout(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::*;
    use crate::docker::{ExecOutput, MockDockerClient};

    fn config(realms: &[&str]) -> KeycloakConfig {
        KeycloakConfig {
            image: "quay.io/keycloak/keycloak:23.0.4".to_owned(),
            name: "e2e-keycloak".to_owned(),
            alias: "keycloak-app".to_owned(),
            admin_realm: "master".to_owned(),
            admin_username: "admin".to_owned(),
            admin_password: "admin".to_owned(),
            command: vec!["start-dev".to_owned(), "--import-realm".to_owned()],
            startup_timeout: 0,
            port: 8080,
            realms: realms
                .iter()
                .map(|name| RealmImport {
                    name: (*name).to_owned(),
                    path: PathBuf::from(format!("imports/realm-{name}.json")),
                })
                .collect(),
            interval: 100,
            timeout: 100,
            retries: 3,
            env: BTreeMap::new(),
        }
    }

    fn network() -> NetworkHandle {
        NetworkHandle {
            id: "net-1".to_owned(),
            name: "testbed-1".to_owned(),
        }
    }

    fn workspace_with(realms: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("imports")).unwrap();
        for name in realms {
            std::fs::write(
                dir.path().join(format!("imports/realm-{name}.json")),
                format!("{{\"realm\":\"{name}\"}}"),
            )
            .unwrap();
        }
        dir
    }

    #[test]
    fn probe_targets_discovery_document() {
        let probe = realm_probe("onecx", 8080);
        assert!(probe.contains("GET /realms/onecx/.well-known/openid-configuration HTTP/1.0"));
        assert!(probe.contains("3<>/dev/tcp/localhost/8080"));
        assert!(probe.ends_with("| head -1 | grep 200"));
    }

    #[test]
    fn composite_probe_ands_every_realm() {
        let cfg = config(&["onecx", "master"]);
        let probe = composite_probe(&cfg.realms, cfg.port);
        assert_eq!(probe.matches(" && ").count(), 1);
        assert!(probe.contains("/realms/onecx/"));
        assert!(probe.contains("/realms/master/"));
    }

    #[test]
    fn spec_copies_realms_and_sets_admin_env() {
        let spec = service_spec(&config(&["onecx"]), Path::new("/work")).unwrap();

        assert_eq!(spec.env["KEYCLOAK_ADMIN"], "admin");
        assert_eq!(spec.env["KC_HTTP_PORT"], "8080");
        assert_eq!(
            spec.command,
            Some(vec!["start-dev".to_owned(), "--import-realm".to_owned()])
        );
        assert_eq!(spec.files.len(), 1);
        assert_eq!(
            spec.files[0].source,
            PathBuf::from("/work/imports/realm-onecx.json")
        );
        assert_eq!(spec.files[0].target, "/opt/keycloak/data/import/onecx.json");
        let policy = spec.health_check.unwrap();
        assert_eq!(policy.command[0], "sh");
        assert_eq!(policy.retries, 3);
    }

    #[test]
    fn spec_requires_a_realm() {
        assert!(service_spec(&config(&[]), Path::new("/work")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_realm_keeps_service_not_ready() {
        let workspace = workspace_with(&["onecx", "master"]);
        // A shell would fail the && chain when any realm answers non-200.
        let docker = Arc::new(MockDockerClient::new().with_exec(|_, cmd| {
            let script = cmd.last().cloned().unwrap_or_default();
            let all_up = script
                .split(" && ")
                .all(|probe| !probe.contains("/realms/master/"));
            Ok(ExecOutput {
                exit_code: Some(if all_up { 0 } else { 1 }),
                output: String::new(),
            })
        }));
        let provisioner = IdentityProvisioner::new(Arc::clone(&docker));
        let mut stack = ResourceStack::new();

        let err = provisioner
            .start(&config(&["onecx", "master"]), workspace.path(), &network(), &mut stack)
            .await
            .unwrap_err();

        assert!(matches!(err, ContainerError::StartupTimeout { .. }));
        assert_eq!(docker.exec_count("e2e-keycloak"), 3);
        assert_eq!(stack.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_when_every_realm_answers() {
        let workspace = workspace_with(&["onecx"]);
        let docker = Arc::new(MockDockerClient::new());
        let provisioner = IdentityProvisioner::new(Arc::clone(&docker));
        let mut stack = ResourceStack::new();

        let service = provisioner
            .start(&config(&["onecx"]), workspace.path(), &network(), &mut stack)
            .await
            .unwrap();

        assert_eq!(service.role, ServiceRole::IdentityProvider);
        assert_eq!(service.alias, "keycloak-app");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_realm_file_fails_before_start() {
        let workspace = tempfile::tempdir().unwrap();
        let docker = Arc::new(MockDockerClient::new());
        let provisioner = IdentityProvisioner::new(Arc::clone(&docker));
        let mut stack = ResourceStack::new();

        let err = provisioner
            .start(&config(&["onecx"]), workspace.path(), &network(), &mut stack)
            .await
            .unwrap_err();

        assert!(matches!(err, ContainerError::Archive { .. }));
        // created, never started, still torn down later
        assert_eq!(stack.len(), 1);
        assert!(docker.calls().iter().all(|c| !matches!(c, crate::docker::MockCall::Start(_))));
    }
}

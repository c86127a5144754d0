use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use testbed_cli::cli::TestbedCli;
use testbed_cli::logging::init_tracing;
use testbed_cli::orchestrator::{Orchestrator, log_summary};
use testbed_container::BollardDockerClient;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = TestbedCli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("testbed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: TestbedCli) -> Result<u8> {
    let config = cli
        .load_config()
        .await
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        println!("  database:   {} ({})", config.database.name, config.database.image);
        println!(
            "  keycloak:   {} ({}), realms: {}",
            config.keycloak.name,
            config.keycloak.image,
            config
                .keycloak
                .realms
                .iter()
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        println!("  shell:      {} ({})", config.shell.name, config.shell.image);
        println!("  containers: {}", config.containers.len());
        println!("  mocks:      {}", config.mocks.len());
        println!("  runner:     {}", config.runner.image);
        return Ok(0);
    }

    init_tracing(&config.general)?;
    testbed_core::metrics::describe_all();
    tracing::info!(config = %cli.config.display(), "testbed starting");

    let docker = if config.general.docker_socket.is_empty() {
        BollardDockerClient::connect_local()
    } else {
        BollardDockerClient::connect_with_socket(&config.general.docker_socket)
    }
    .context("failed to create docker client")?;

    let workspace = std::path::absolute(&cli.workspace)
        .with_context(|| format!("invalid workspace {}", cli.workspace.display()))?;
    let orchestrator = Orchestrator::new(config, workspace, Arc::new(docker))?;

    let report = orchestrator.run().await;
    log_summary(&report);
    Ok(report.exit_code())
}

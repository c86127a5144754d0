//! Network Manager -- one isolated bridge network per run.

use std::sync::Arc;

use tracing::info;

use crate::docker::DockerClient;
use crate::error::ContainerError;

/// Handle to the run's network; released last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    /// Platform id
    pub id: String,
    /// Unique network name (`<prefix>-<uuid>`)
    pub name: String,
}

/// Creates the per-run network.
pub struct NetworkManager<D: DockerClient> {
    docker: Arc<D>,
    prefix: String,
}

impl<D: DockerClient> NetworkManager<D> {
    pub fn new(docker: Arc<D>, prefix: impl Into<String>) -> Self {
        Self {
            docker,
            prefix: prefix.into(),
        }
    }

    /// Creates a fresh network.
    ///
    /// Not retried: without a network nothing else can start.
    pub async fn create(&self) -> Result<NetworkHandle, ContainerError> {
        let name = format!("{}-{}", self.prefix, uuid::Uuid::new_v4());
        let id = self.docker.create_network(&name).await?;
        info!(network = %name, network_id = %id, "network created");
        Ok(NetworkHandle { id, name })
    }
}

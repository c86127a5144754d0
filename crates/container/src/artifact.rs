//! Artifact Collector -- pulls the screenshot/video directory out of the
//! test runner.
//!
//! Collection is best-effort: every failure is a
//! [`ContainerError::Collection`], which is never fatal. `collect` resolves
//! only after the archive is fully written, flushed and synced, so the
//! runner can be stopped as soon as it returns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use testbed_core::metrics as m;
use testbed_core::types::ArtifactBundle;

use crate::archive;
use crate::docker::DockerClient;
use crate::error::ContainerError;
use crate::provision::StartedService;

/// Where artifacts come from and where they go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactTarget {
    /// Directory inside the runner
    pub source: String,
    /// Local archive file, removed after extraction
    pub archive_path: PathBuf,
    /// Local extraction directory
    pub extract_dir: PathBuf,
}

pub struct ArtifactCollector<D: DockerClient> {
    docker: Arc<D>,
}

impl<D: DockerClient> ArtifactCollector<D> {
    pub fn new(docker: Arc<D>) -> Self {
        Self { docker }
    }

    /// Downloads, writes and unpacks the runner's artifacts.
    pub async fn collect(
        &self,
        runner: &StartedService,
        target: &ArtifactTarget,
    ) -> Result<ArtifactBundle, ContainerError> {
        let result = self.collect_inner(runner, target).await;

        let label = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(m::ARTIFACT_COLLECTIONS_TOTAL, m::LABEL_RESULT => label).increment(1);

        match &result {
            Ok(bundle) => info!(
                entries = bundle.entries.len(),
                bytes = bundle.bytes_written,
                dir = %bundle.extract_dir.display(),
                "artifacts collected"
            ),
            Err(e) => warn!(error = %e, "artifact collection failed"),
        }
        result
    }

    async fn collect_inner(
        &self,
        runner: &StartedService,
        target: &ArtifactTarget,
    ) -> Result<ArtifactBundle, ContainerError> {
        let bytes_written = match self.write_archive(runner, target).await {
            Ok(written) => written,
            Err(e) => {
                discard_partial(&target.archive_path).await;
                return Err(e);
            }
        };

        let archive_path = target.archive_path.clone();
        let extract_dir = target.extract_dir.clone();
        let entries = tokio::task::spawn_blocking(move || archive::unpack(&archive_path, &extract_dir))
            .await
            .map_err(|e| collection(format!("unpack task failed: {e}")))?
            .map_err(|e| collection(e.to_string()))?;

        if let Err(e) = tokio::fs::remove_file(&target.archive_path).await {
            warn!(path = %target.archive_path.display(), error = %e, "could not remove archive");
        }

        Ok(ArtifactBundle {
            archive_path: target.archive_path.clone(),
            extract_dir: target.extract_dir.clone(),
            entries,
            bytes_written,
        })
    }

    /// Streams the archive to disk; returns the byte count once synced.
    async fn write_archive(
        &self,
        runner: &StartedService,
        target: &ArtifactTarget,
    ) -> Result<u64, ContainerError> {
        if let Some(parent) = target.archive_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure(parent, e))?;
        }

        let mut file = tokio::fs::File::create(&target.archive_path)
            .await
            .map_err(|e| io_failure(&target.archive_path, e))?;
        let mut stream = self
            .docker
            .download_archive(&runner.container_id, &target.source);

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| match e {
                e @ ContainerError::Collection(_) => e,
                other => collection(other.to_string()),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| io_failure(&target.archive_path, e))?;
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| io_failure(&target.archive_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_failure(&target.archive_path, e))?;
        Ok(written)
    }
}

/// Best-effort removal of a truncated archive.
async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial archive"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial archive"),
    }
}

fn collection(reason: String) -> ContainerError {
    ContainerError::Collection(reason)
}

fn io_failure(path: &Path, err: std::io::Error) -> ContainerError {
    ContainerError::Collection(format!("{}: {err}", path.display()))
}

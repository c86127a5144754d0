//! Health Check Poller -- the single readiness primitive.
//!
//! Every provisioner gates on [`HealthCheckPoller::wait_ready`]. A probe is
//! the policy's command executed inside the container; exit code 0 means
//! ready. The first probe runs immediately, later ones `interval` apart, and
//! each is bounded by `timeout`. After `retries` failed probes the service is
//! reported as [`ContainerError::StartupTimeout`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use testbed_core::metrics as m;
use testbed_core::types::HealthCheckPolicy;

use crate::docker::DockerClient;
use crate::error::ContainerError;

/// Outcome of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Probes executed, including the successful one
    pub attempts: u32,
}

/// Polls a container until its probe succeeds or retries run out.
pub struct HealthCheckPoller<D: DockerClient> {
    docker: Arc<D>,
}

impl<D: DockerClient> HealthCheckPoller<D> {
    pub fn new(docker: Arc<D>) -> Self {
        Self { docker }
    }

    /// Blocks until `container_id` passes `policy`.
    ///
    /// # Errors
    ///
    /// `ContainerError::StartupTimeout` carrying the last probe failure once
    /// `policy.retries` probes have failed.
    pub async fn wait_ready(
        &self,
        service: &str,
        container_id: &str,
        policy: &HealthCheckPolicy,
    ) -> Result<Readiness, ContainerError> {
        let mut last_error = String::from("no probe executed");

        for attempt in 1..=policy.retries {
            if attempt > 1 {
                tokio::time::sleep(policy.interval).await;
            }

            match self.probe(container_id, policy).await {
                Ok(()) => {
                    metrics::counter!(
                        m::HEALTH_PROBES_TOTAL,
                        m::LABEL_SERVICE => service.to_owned(),
                        m::LABEL_RESULT => "success"
                    )
                    .increment(1);
                    info!(service, attempt, "service ready");
                    return Ok(Readiness { attempts: attempt });
                }
                Err(reason) => {
                    metrics::counter!(
                        m::HEALTH_PROBES_TOTAL,
                        m::LABEL_SERVICE => service.to_owned(),
                        m::LABEL_RESULT => "failure"
                    )
                    .increment(1);
                    debug!(
                        service,
                        attempt,
                        retries = policy.retries,
                        reason = %reason,
                        "health probe failed"
                    );
                    last_error = reason;
                }
            }
        }

        warn!(
            service,
            retries = policy.retries,
            last_error = %last_error,
            "health check exhausted"
        );
        Err(ContainerError::StartupTimeout {
            service: service.to_owned(),
            last_error,
        })
    }

    /// Single probe. `Err` carries a human-readable reason.
    async fn probe(&self, container_id: &str, policy: &HealthCheckPolicy) -> Result<(), String> {
        match tokio::time::timeout(
            policy.timeout,
            self.docker.exec(container_id, &policy.command),
        )
        .await
        {
            Ok(Ok(out)) if out.success() => Ok(()),
            Ok(Ok(out)) => Err(match out.exit_code {
                Some(code) => format!("probe exited with {code}: {}", out.output.trim()),
                None => "probe reported no exit code".to_owned(),
            }),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_elapsed) => Err(format!(
                "probe timed out after {}ms",
                policy.timeout.as_millis()
            )),
        }
    }
}

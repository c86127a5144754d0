//! Metric names and descriptions.
//!
//! Every component records through the `metrics` facade using these
//! constants. Without an installed recorder the calls are no-ops.
//!
//! # Naming
//!
//! - prefix: `testbed_`
//! - suffix: `_total` (counter), `_seconds` (histogram)

// ─── Label keys ─────────────────────────────────────────────────────

/// Service label (database, keycloak, shell, container name, runner)
pub const LABEL_SERVICE: &str = "service";

/// Result label (success, failure)
pub const LABEL_RESULT: &str = "result";

/// Resource kind label (network, container)
pub const LABEL_RESOURCE: &str = "resource";

// ─── Provisioning ───────────────────────────────────────────────────

/// Containers created and started (counter, label: service)
pub const SERVICES_STARTED_TOTAL: &str = "testbed_services_started_total";

/// Time from create to ready (histogram, seconds, label: service)
pub const SERVICE_STARTUP_DURATION_SECONDS: &str = "testbed_service_startup_duration_seconds";

/// Health probes executed (counter, labels: service, result)
pub const HEALTH_PROBES_TOTAL: &str = "testbed_health_probes_total";

// ─── Run ────────────────────────────────────────────────────────────

/// Completed runs (counter, label: result)
pub const RUNS_TOTAL: &str = "testbed_runs_total";

/// Artifact collection attempts (counter, label: result)
pub const ARTIFACT_COLLECTIONS_TOTAL: &str = "testbed_artifact_collections_total";

/// Resources released during teardown (counter, labels: resource, result)
pub const TEARDOWN_RELEASES_TOTAL: &str = "testbed_teardown_releases_total";

/// Registers descriptions for every metric above.
///
/// Call once after installing a recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_histogram};

    describe_counter!(
        SERVICES_STARTED_TOTAL,
        "Containers created and started by the provisioners"
    );
    describe_histogram!(
        SERVICE_STARTUP_DURATION_SECONDS,
        "Time from container create until the service is ready"
    );
    describe_counter!(
        HEALTH_PROBES_TOTAL,
        "Health probes executed, by service and result"
    );
    describe_counter!(RUNS_TOTAL, "Completed runs, by result");
    describe_counter!(
        ARTIFACT_COLLECTIONS_TOTAL,
        "Artifact collection attempts, by result"
    );
    describe_counter!(
        TEARDOWN_RELEASES_TOTAL,
        "Resources released during teardown, by kind and result"
    );
}

//! Structured health reporting for service lifecycle events.

use std::sync::Arc;

use sandbox_config::Config;
use sandbox_manager::SandboxDump;

use crate::bootstrap::BootstrapError;

/// Tracing target for health events.
const HEALTH_TARGET: &str = "sandbox_service::health";

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after bootstrap completes successfully.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked when an operator asks for the sandbox state.
    fn state_reported(&self, dump: &SandboxDump);

    /// Invoked once the service has drained its background work.
    fn shutdown_completed(&self);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn state_reported(&self, dump: &SandboxDump) {
        (**self).state_reported(dump);
    }

    fn shutdown_completed(&self) {
        (**self).shutdown_completed();
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting sandbox service bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            worker_service = %config.worker_service(),
            bind_retry_limit = config.bind_retry_limit(),
            log_filter = %config.log_filter(),
            log_format = %config.log_format(),
            "sandbox service bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "sandbox service bootstrap failed"
        );
    }

    fn state_reported(&self, dump: &SandboxDump) {
        let state = serde_json::to_string(dump)
            .unwrap_or_else(|error| format!("unserialisable dump: {error}"));
        tracing::info!(
            target: HEALTH_TARGET,
            event = "state_reported",
            tokens = dump.token_count,
            links = dump.link_count,
            bindings = dump.bindings.len(),
            instrumented = dump.instrumented.len(),
            state = %state,
            "sandbox state"
        );
    }

    fn shutdown_completed(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "shutdown_completed",
            "sandbox service stopped"
        );
    }
}

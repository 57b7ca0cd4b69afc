//! Service bootstrap orchestration.

use std::fmt;
use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;

use sandbox_config::{Config, ConfigValidationError};
use sandbox_manager::{
    Collaborators, ManagerSettings, ReconcileError, SandboxDump, SandboxManager,
};

use crate::health::HealthReporter;
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the service configuration.
    ///
    /// # Errors
    ///
    /// Returns the layered loader's error when any source fails to parse.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning a configuration resolved elsewhere.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already resolved configuration.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Configuration loaded but holds unusable values.
    #[error("invalid configuration: {source}")]
    Validation {
        /// Rejected value.
        #[source]
        source: ConfigValidationError,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The sandbox manager could not start.
    #[error("failed to start the sandbox manager: {source}")]
    Manager {
        /// Underlying manager error.
        #[source]
        source: ReconcileError,
    },
}

/// Result of a successful bootstrap invocation.
pub struct SandboxService {
    config: Config,
    manager: SandboxManager,
    telemetry: TelemetryHandle,
    reporter: Arc<dyn HealthReporter>,
}

impl fmt::Debug for SandboxService {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SandboxService")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl SandboxService {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The manager serving the public contract.
    #[must_use]
    pub const fn manager(&self) -> &SandboxManager {
        &self.manager
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Captures the sandbox state and reports it through the health reporter.
    pub fn report_state(&self) -> SandboxDump {
        let dump = self.manager.dump();
        self.reporter.state_reported(&dump);
        dump
    }

    /// Drains the reconciliation queue and reports the shutdown.
    pub fn shutdown(self) {
        self.manager.shutdown();
        self.reporter.shutdown_completed();
    }
}

/// Bootstraps the service using the supplied collaborators.
///
/// # Errors
///
/// Returns [`BootstrapError`] when configuration cannot be loaded or
/// validated, telemetry cannot be installed, or the manager fails to start.
/// Every failure is also reported through `reporter`.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    collaborators: Collaborators,
) -> Result<SandboxService, BootstrapError> {
    reporter.bootstrap_starting();

    let config = match loader.load() {
        Ok(config) => config,
        Err(source) => return Err(report(&*reporter, BootstrapError::Configuration { source })),
    };

    if let Err(source) = config.validate() {
        return Err(report(&*reporter, BootstrapError::Validation { source }));
    }

    let telemetry = match telemetry::initialise(&config) {
        Ok(handle) => handle,
        Err(source) => return Err(report(&*reporter, BootstrapError::Telemetry { source })),
    };

    let settings = ManagerSettings::default()
        .with_worker_service(config.worker_service())
        .with_bind_retry_limit(config.bind_retry_limit());
    let manager = match SandboxManager::new(&settings, collaborators) {
        Ok(manager) => manager,
        Err(source) => return Err(report(&*reporter, BootstrapError::Manager { source })),
    };

    reporter.bootstrap_succeeded(&config);
    Ok(SandboxService {
        config,
        manager,
        telemetry,
        reporter,
    })
}

fn report(reporter: &dyn HealthReporter, error: BootstrapError) -> BootstrapError {
    reporter.bootstrap_failed(&error);
    error
}

//! Bootstrap logic for the extension sandbox service.
//!
//! The service wires a [`sandbox_manager::SandboxManager`] from layered
//! configuration ([`sandbox_config`]) and the host environment's
//! collaborators: the process supervisor, the extension resolver, the caller
//! liveness source and the data-directory reconciler. Bootstrap loads and
//! validates configuration, installs structured telemetry, starts the
//! manager, and reports each stage through a [`HealthReporter`] so operators
//! can tell where start-up failed.

mod bootstrap;
mod health;
pub mod telemetry;

pub use bootstrap::{
    BootstrapError, ConfigLoader, SandboxService, StaticConfigLoader, SystemConfigLoader,
    bootstrap_with,
};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;

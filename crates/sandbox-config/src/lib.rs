//! Shared configuration for the extension sandbox service.
//!
//! Configuration is layered by [`ortho_config`]: built-in defaults, then an
//! optional configuration file, then `SANDBOX_*` environment variables, and
//! finally command-line flags. The resolved [`Config`] is validated once by
//! the service bootstrap before any collaborator is wired.

mod defaults;
mod logging;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_BIND_RETRY_LIMIT, DEFAULT_LOG_FILTER, DEFAULT_WORKER_SERVICE, MAX_BIND_RETRY_LIMIT,
    default_bind_retry_limit, default_log_filter, default_log_filter_string, default_log_format,
    default_worker_service_string,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Resolved configuration for the sandbox service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "SANDBOX")]
pub struct Config {
    /// Tracing filter expression applied to the telemetry subscriber.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Output format for structured logs.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Worker component the process supervisor starts for each caller.
    #[ortho_config(default = default_worker_service_string())]
    pub worker_service: String,
    /// Automatic rebinds attempted after a worker dies while binding.
    #[ortho_config(default = default_bind_retry_limit())]
    pub bind_retry_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            worker_service: default_worker_service_string(),
            bind_retry_limit: default_bind_retry_limit(),
        }
    }
}

impl Config {
    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Logging output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Worker component started per caller identity.
    #[must_use]
    pub fn worker_service(&self) -> &str {
        self.worker_service.as_str()
    }

    /// Maximum number of automatic rebinds after a binding dies.
    #[must_use]
    pub const fn bind_retry_limit(&self) -> u32 {
        self.bind_retry_limit
    }

    /// Checks values that the layered loader cannot reject on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigValidationError`] when the worker component is blank
    /// or the retry limit exceeds [`MAX_BIND_RETRY_LIMIT`].
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.worker_service.trim().is_empty() {
            return Err(ConfigValidationError::EmptyWorkerService);
        }
        if self.bind_retry_limit > MAX_BIND_RETRY_LIMIT {
            return Err(ConfigValidationError::RetryLimitTooHigh {
                value: self.bind_retry_limit,
                max: MAX_BIND_RETRY_LIMIT,
            });
        }
        Ok(())
    }
}

/// Errors raised by [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    /// The worker component name was empty or whitespace.
    #[error("worker_service must name a worker component")]
    EmptyWorkerService,
    /// The retry limit exceeds [`MAX_BIND_RETRY_LIMIT`].
    #[error("bind_retry_limit {value} exceeds the maximum of {max}")]
    RetryLimitTooHigh {
        /// Configured value.
        value: u32,
        /// Largest accepted value.
        max: u32,
    },
}

//! Default values shared by the configuration layers.

use crate::logging::LogFormat;

/// Default log filter expression used by the sandbox service.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Worker component started for each caller identity unless overridden.
pub const DEFAULT_WORKER_SERVICE: &str = "sandbox.worker.ExtensionHostService";

/// Number of automatic rebinds attempted after a worker dies mid-bind.
pub const DEFAULT_BIND_RETRY_LIMIT: u32 = 1;

/// Upper bound accepted for the bind retry limit.
pub const MAX_BIND_RETRY_LIMIT: u32 = 3;

/// Default log filter expression.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Owned worker component name.
#[must_use]
pub fn default_worker_service_string() -> String {
    DEFAULT_WORKER_SERVICE.to_owned()
}

/// Default bind retry limit.
#[must_use]
pub const fn default_bind_retry_limit() -> u32 {
    DEFAULT_BIND_RETRY_LIMIT
}

//! Log output formats understood by the service telemetry.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How the service renders its log records on stderr.
///
/// Parsed case-insensitively from `SANDBOX_LOG_FORMAT`, `--log-format` or the
/// configuration file.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per record, fields flattened.
    #[default]
    Json,
    /// Terse single-line text for interactive use.
    Compact,
}

impl LogFormat {
    /// Returns `true` when records are meant for a log collector rather than a
    /// terminal. Such output never carries ANSI colour codes.
    #[must_use]
    pub const fn is_machine_readable(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Error returned when a log format name is not recognised.
pub type LogFormatParseError = strum::ParseError;

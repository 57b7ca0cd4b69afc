//! Domain errors surfaced by the sandbox manager.
//!
//! [`SandboxError`] is what callers see: security failures are returned
//! synchronously, everything else reaches the host through its
//! [`LoadCallback`](crate::link::LoadCallback). Collaborator errors have their
//! own small types and are folded into [`SandboxError::Internal`] at the
//! manager boundary.

use thiserror::Error;

use crate::identity::{CallerId, CallerProof};

/// Coarse classification of a [`SandboxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Identity mismatch, instrumentation block, policy violation, bad token.
    Security,
    /// A load for the same caller and extension is already live.
    AlreadyLoaded,
    /// The extension is unknown or has no entry point.
    NotFound,
    /// Binding or remote invocation failed.
    Internal,
    /// The extension itself rejected the load.
    ExtensionFailed,
}

/// Errors raised by sandbox operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    /// The request was refused for security reasons. Never retried.
    #[error("security violation: {message}")]
    Security {
        /// Description of the violated rule.
        message: String,
    },

    /// A load session already exists for this caller and extension.
    #[error("extension '{name}' is already loaded")]
    AlreadyLoaded {
        /// Extension name.
        name: String,
    },

    /// The extension could not be resolved.
    #[error("extension '{name}' not found: {reason}")]
    NotFound {
        /// Extension name.
        name: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Binding to the worker or invoking it failed.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable failure description.
        message: String,
    },

    /// The worker ran the extension's entry point and it reported failure.
    #[error("extension '{name}' failed to load (code {code}): {message}")]
    ExtensionFailed {
        /// Extension name.
        name: String,
        /// Extension-defined error code.
        code: i32,
        /// Extension-defined message.
        message: String,
    },
}

impl SandboxError {
    /// Builds a [`SandboxError::Security`] error.
    #[must_use]
    pub fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    /// Builds a [`SandboxError::Internal`] error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Security error returned for tokens with no live session.
    #[must_use]
    pub fn invalid_token() -> Self {
        Self::security("token is invalid")
    }

    pub(crate) fn identity_mismatch(caller: &CallerId, proof: CallerProof) -> Self {
        Self::security(format!(
            "caller {caller} does not match the calling identity uid {}",
            proof.uid()
        ))
    }

    pub(crate) fn instrumentation_active(caller: &CallerId) -> Self {
        Self::security(format!(
            "an instrumentation run is active for {caller}; extension loads are suspended"
        ))
    }

    pub(crate) fn not_found(name: &str, reason: impl Into<String>) -> Self {
        Self::NotFound {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }

    /// Returns the coarse classification of the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Security { .. } => ErrorKind::Security,
            Self::AlreadyLoaded { .. } => ErrorKind::AlreadyLoaded,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::ExtensionFailed { .. } => ErrorKind::ExtensionFailed,
        }
    }
}

/// A remote call across a worker or extension binding failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote invocation failed: {message}")]
pub struct RemoteError {
    message: String,
}

impl RemoteError {
    /// Builds a remote error with the given description.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Description of the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_str()
    }
}

/// The process supervisor refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("process supervisor rejected the request: {message}")]
pub struct SupervisorError {
    message: String,
}

impl SupervisorError {
    /// Builds a supervisor error with the given description.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

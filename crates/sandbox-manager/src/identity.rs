//! Caller identities and the transport-level proof that accompanies them.

use std::fmt;

use serde::Serialize;

/// Security principal on whose behalf a request is made.
///
/// A caller is the host application instance identified by its uid and the
/// package it runs as. Each caller gets at most one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallerId {
    uid: u32,
    package: String,
}

impl CallerId {
    /// Builds a caller identity.
    #[must_use]
    pub fn new(uid: u32, package: impl Into<String>) -> Self {
        Self {
            uid,
            package: package.into(),
        }
    }

    /// Numeric identity of the caller.
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// Package name the caller runs as.
    #[must_use]
    pub fn package(&self) -> &str {
        self.package.as_str()
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.package, self.uid)
    }
}

/// Identity observed by the transport for an incoming call.
///
/// Callers cannot construct a proof for somebody else: the transport fills it
/// in from the connection credentials, and the manager checks that it agrees
/// with the claimed [`CallerId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerProof {
    uid: u32,
}

impl CallerProof {
    /// Records the uid the transport saw on the incoming connection.
    #[must_use]
    pub const fn from_transport(uid: u32) -> Self {
        Self { uid }
    }

    /// Uid observed by the transport.
    #[must_use]
    pub const fn uid(self) -> u32 {
        self.uid
    }

    /// Returns `true` when the proof resolves to the claimed caller.
    #[must_use]
    pub const fn vouches_for(self, caller: &CallerId) -> bool {
        self.uid == caller.uid
    }
}

//! Subscription to caller liveness.

use thiserror::Error;

use crate::identity::CallerId;

/// Cleanup run once when a watched caller becomes unreachable.
pub type DeathNotice = Box<dyn FnOnce() + Send>;

/// The caller was already unreachable when the watch was requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("caller {caller} is no longer reachable")]
pub struct CallerGone {
    /// Caller that could not be watched.
    pub caller: CallerId,
}

/// Source of caller death notifications.
pub trait LivenessSource: Send + Sync {
    /// Runs `on_death` when `caller` dies. The notice may run on any thread.
    ///
    /// # Errors
    ///
    /// Returns [`CallerGone`] when the caller is already dead; `on_death` is
    /// dropped without running in that case.
    fn watch(&self, caller: &CallerId, on_death: DeathNotice) -> Result<(), CallerGone>;
}

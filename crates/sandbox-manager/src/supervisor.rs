//! Capability interface onto the external process supervisor.
//!
//! The manager never creates processes. It asks a [`ProcessSupervisor`] to
//! bind one worker per caller and learns about the outcome through a
//! [`ConnectionListener`]. Listener methods fire on the supervisor's own
//! execution context, possibly before [`ProcessSupervisor::bind`] returns.

use std::fmt;
use std::sync::Arc;

use crate::error::{RemoteError, SupervisorError};
use crate::identity::CallerId;
use crate::link::{LoadSink, Params};
use crate::resolver::ExtensionInfo;
use crate::token::Token;

/// Worker component the supervisor is asked to start for a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerComponent {
    service: String,
}

impl WorkerComponent {
    /// Names the worker service to start.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Service name.
    #[must_use]
    pub fn service(&self) -> &str {
        self.service.as_str()
    }
}

impl fmt::Display for WorkerComponent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.service)
    }
}

/// Starts, stops and rebinds one worker process per caller identity.
pub trait ProcessSupervisor: Send + Sync {
    /// Creates (or attaches to) the caller's worker with auto-create
    /// semantics and reports progress through `listener`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError`] when the request is refused outright. In
    /// that case no listener event follows.
    fn bind(
        &self,
        caller: &CallerId,
        component: &WorkerComponent,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<(), SupervisorError>;

    /// Releases the connection to the caller's worker.
    fn unbind(&self, caller: &CallerId);

    /// Terminates the caller's worker process.
    fn kill(&self, caller: &CallerId);
}

/// Receives asynchronous connection events for one bind request.
pub trait ConnectionListener: Send + Sync {
    /// The worker is up and reachable through `worker`.
    fn connected(&self, worker: Arc<dyn WorkerHandle>);

    /// The worker went away; the supervisor will reconnect on its own.
    fn disconnected(&self);

    /// The binding itself died, typically because the worker crashed while
    /// starting.
    fn binding_died(&self);

    /// The worker started but refused to hand out an interface.
    fn null_binding(&self);
}

/// Live handle onto a caller's worker process.
pub trait WorkerHandle: Send + Sync {
    /// Asks the worker to load an extension. The outcome arrives later
    /// through `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the call could not be delivered.
    fn load_extension(
        &self,
        request: LoadRequest,
        sink: Arc<dyn LoadSink>,
    ) -> Result<(), RemoteError>;
}

/// Everything a worker needs to instantiate an extension.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    /// Session token the load belongs to.
    pub token: Token,
    /// Caller that requested the load.
    pub caller: CallerId,
    /// Resolved extension metadata.
    pub extension: ExtensionInfo,
    /// Opaque parameters forwarded from the caller.
    pub params: Params,
}

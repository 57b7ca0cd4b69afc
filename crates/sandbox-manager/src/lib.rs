//! Control plane for loading untrusted extensions into isolated workers.
//!
//! A host application asks the [`SandboxManager`] to load an extension by
//! name. The manager issues an opaque [`Token`] for the (caller, extension)
//! pair, resolves the extension through an [`ExtensionResolver`], binds the
//! caller's dedicated worker process through a [`ProcessSupervisor`], and asks
//! the worker to load the extension. The result reaches the host through its
//! [`LoadCallback`]. After a successful load the host addresses the extension
//! with the token, for example via [`SandboxManager::request_surface`].
//!
//! Sessions end deterministically. Caller death, the start of an
//! instrumentation run, and an update to a package whose code is loaded all
//! tear down the affected sessions and kill the worker. Data-directory
//! reconciliation runs on a serial background queue so none of the public
//! operations block on filesystem work.
//!
//! The [`policy`] module holds the stateless allow-rules the host consults
//! before letting a worker send broadcasts, start activities or bind
//! services.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sandbox_manager::{
//!     CallerId, CallerProof, Collaborators, LoadCallback, ManagerSettings, Params,
//!     SandboxManager,
//! };
//!
//! # fn run(collaborators: Collaborators, host: Arc<dyn LoadCallback>)
//! #     -> Result<(), Box<dyn std::error::Error>> {
//! let manager = SandboxManager::new(&ManagerSettings::default(), collaborators)?;
//! let caller = CallerId::new(10_001, "com.example.host");
//! manager.load_extension(
//!     &caller,
//!     CallerProof::from_transport(10_001),
//!     "weather-widget",
//!     Params::new(),
//!     host,
//! )?;
//! # Ok(()) }
//! ```

mod binding;
mod error;
mod identity;
mod link;
mod liveness;
mod manager;
pub mod policy;
mod reconcile;
mod resolver;
mod supervisor;
mod token;

pub use binding::{BindError, BindingSnapshot, BindingStatus, Waiter, WorkerConnections};
pub use error::{ErrorKind, RemoteError, SandboxError, SupervisorError};
pub use identity::{CallerId, CallerProof};
pub use link::{
    ExtensionCallback, HostExtensionLink, HostSurface, LinkTable, LoadCallback, LoadSink,
    LoadedExtension, Params, SurfaceRequest,
};
pub use liveness::{CallerGone, DeathNotice, LivenessSource};
pub use manager::{
    Collaborators, DEFAULT_BIND_RETRY_LIMIT, DEFAULT_WORKER_SERVICE, LoadedSummary,
    ManagerSettings, SandboxDump, SandboxManager,
};
pub use reconcile::{DataDirReconciler, ReconcileError, ReconcileJob, ReconcileQueue};
pub use resolver::{ExtensionInfo, ExtensionResolver};
pub use supervisor::{
    ConnectionListener, LoadRequest, ProcessSupervisor, WorkerComponent, WorkerHandle,
};
pub use token::{SessionKey, Token, TokenRegistry};

#[cfg(test)]
mod tests;

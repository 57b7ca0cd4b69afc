//! Host/extension links and the table that owns them.
//!
//! A [`HostExtensionLink`] is the callback bridge for one token. It holds the
//! host's [`LoadCallback`] from creation and, once the worker reports a
//! successful load, the extension's [`ExtensionCallback`]. The worker talks to
//! the link through the [`LoadSink`] trait.
//!
//! Links move from `Pending` to `Established`, and end either `Closed` (the
//! load failed) or `TornDown` (the caller's sessions were dropped). Both end
//! states ignore late worker callbacks, which is how an in-flight load is
//! cancelled when its token is torn down.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::error::{RemoteError, SandboxError};
use crate::identity::CallerId;
use crate::token::Token;

/// Tracing target for link operations.
const LINK_TARGET: &str = "sandbox_manager::link";

/// Opaque parameter bundle passed through the sandbox unchanged.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Host-side handle of the surface an extension should render into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostSurface(u64);

impl HostSurface {
    /// Wraps a raw host surface handle.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Surface request forwarded to a loaded extension.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceRequest {
    /// Surface owned by the host.
    pub host_surface: HostSurface,
    /// Display the surface is shown on.
    pub display_id: u32,
    /// Extension-specific parameters.
    pub params: Params,
}

/// Successful load delivered to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedExtension {
    token: Token,
    name: String,
    info: Params,
}

impl LoadedExtension {
    /// Token addressing the session from now on.
    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    /// Extension name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Extra data the extension returned from its entry point.
    #[must_use]
    pub const fn info(&self) -> &Params {
        &self.info
    }
}

/// Host-side callback receiving the outcome of one load.
pub trait LoadCallback: Send + Sync {
    /// The extension is loaded and reachable through the returned token.
    fn load_succeeded(&self, loaded: LoadedExtension);

    /// The load failed; the token is already gone.
    fn load_failed(&self, error: SandboxError);
}

/// Extension-side callback available once a load succeeds.
pub trait ExtensionCallback: Send + Sync {
    /// Asks the extension to produce a surface for the host.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the request could not be delivered.
    fn surface_requested(&self, request: SurfaceRequest) -> Result<(), RemoteError>;
}

/// Sink the worker reports load results to.
pub trait LoadSink: Send + Sync {
    /// The extension's entry point ran and returned `extension`.
    fn load_succeeded(&self, extension: Arc<dyn ExtensionCallback>, info: Params);

    /// The extension's entry point reported an error.
    fn load_failed(&self, code: i32, message: String);
}

/// Removes a failed link's token and table entry.
pub(crate) trait LinkOwner: Send + Sync {
    fn release(&self, token: &Token);
}

enum LinkState {
    Pending,
    Established(Arc<dyn ExtensionCallback>),
    /// The load failed and the token was released.
    Closed,
    /// The caller's sessions were torn down.
    TornDown,
}

/// Callback bridge between a host and the extension it loaded.
pub struct HostExtensionLink {
    token: Token,
    caller: CallerId,
    name: String,
    host: Arc<dyn LoadCallback>,
    owner: Weak<dyn LinkOwner>,
    state: Mutex<LinkState>,
}

impl fmt::Debug for HostExtensionLink {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HostExtensionLink")
            .field("token", &self.token)
            .field("caller", &self.caller)
            .field("name", &self.name)
            .field("established", &self.is_established())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl HostExtensionLink {
    pub(crate) fn new(
        token: Token,
        caller: CallerId,
        name: impl Into<String>,
        host: Arc<dyn LoadCallback>,
        owner: Weak<dyn LinkOwner>,
    ) -> Self {
        Self {
            token,
            caller,
            name: name.into(),
            host,
            owner,
            state: Mutex::new(LinkState::Pending),
        }
    }

    /// Token the link belongs to.
    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    /// Caller owning the link.
    #[must_use]
    pub const fn caller(&self) -> &CallerId {
        &self.caller
    }

    /// Extension name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns `true` once the worker reported a successful load.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(*self.lock(), LinkState::Established(_))
    }

    /// Returns `true` once the link failed or was torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.lock(), LinkState::Closed | LinkState::TornDown)
    }

    /// Returns `true` when the caller's sessions were torn down while this
    /// link was live.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        matches!(*self.lock(), LinkState::TornDown)
    }

    /// Fails a pending load: the token is released and the host told why.
    ///
    /// Links that already settled are left untouched.
    pub(crate) fn fail(&self, error: SandboxError) {
        {
            let mut state = self.lock();
            if !matches!(*state, LinkState::Pending) {
                debug!(
                    target: LINK_TARGET,
                    token = %self.token,
                    error = %error,
                    "ignoring failure for a settled link"
                );
                return;
            }
            *state = LinkState::Closed;
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.release(&self.token);
        }
        debug!(
            target: LINK_TARGET,
            token = %self.token,
            caller = %self.caller,
            extension = %self.name,
            error = %error,
            "load failed"
        );
        self.host.load_failed(error);
    }

    /// Tears the link down without notifying the host.
    pub(crate) fn close(&self) {
        *self.lock() = LinkState::TornDown;
    }

    /// Forwards a surface request to the extension. Failures are logged only.
    pub(crate) fn request_surface(&self, request: SurfaceRequest) {
        let extension = match &*self.lock() {
            LinkState::Established(extension) => Arc::clone(extension),
            LinkState::Pending | LinkState::Closed | LinkState::TornDown => {
                warn!(
                    target: LINK_TARGET,
                    token = %self.token,
                    extension = %self.name,
                    "dropping surface request for an extension that is not loaded"
                );
                return;
            }
        };

        if let Err(error) = extension.surface_requested(request) {
            warn!(
                target: LINK_TARGET,
                token = %self.token,
                extension = %self.name,
                error = %error,
                "failed to forward surface request"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl LoadSink for HostExtensionLink {
    fn load_succeeded(&self, extension: Arc<dyn ExtensionCallback>, info: Params) {
        {
            let mut state = self.lock();
            match *state {
                LinkState::Pending => *state = LinkState::Established(extension),
                LinkState::Established(_) => {
                    warn!(
                        target: LINK_TARGET,
                        token = %self.token,
                        "ignoring repeated load success"
                    );
                    return;
                }
                LinkState::Closed | LinkState::TornDown => {
                    debug!(
                        target: LINK_TARGET,
                        token = %self.token,
                        "load finished after the session was closed"
                    );
                    return;
                }
            }
        }

        debug!(
            target: LINK_TARGET,
            token = %self.token,
            caller = %self.caller,
            extension = %self.name,
            "extension loaded"
        );
        self.host.load_succeeded(LoadedExtension {
            token: self.token,
            name: self.name.clone(),
            info,
        });
    }

    fn load_failed(&self, code: i32, message: String) {
        self.fail(SandboxError::ExtensionFailed {
            name: self.name.clone(),
            code,
            message,
        });
    }
}

/// Live links keyed by token.
///
/// The table has no lock of its own; it lives inside the manager's state and
/// is only touched while that lock is held.
#[derive(Debug, Default)]
pub struct LinkTable {
    links: HashMap<Token, Arc<HostExtensionLink>>,
}

impl LinkTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a link for its token.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::AlreadyLoaded`] when the token already has a
    /// link. The existing link is left in place.
    pub fn register(&mut self, link: Arc<HostExtensionLink>) -> Result<(), SandboxError> {
        let token = link.token();
        if self.links.contains_key(&token) {
            return Err(SandboxError::AlreadyLoaded {
                name: link.name().to_owned(),
            });
        }
        self.links.insert(token, link);
        Ok(())
    }

    /// Looks up the link for a token.
    #[must_use]
    pub fn get(&self, token: &Token) -> Option<&Arc<HostExtensionLink>> {
        self.links.get(token)
    }

    /// Returns `true` when the token has a live link.
    #[must_use]
    pub fn contains(&self, token: &Token) -> bool {
        self.links.contains_key(token)
    }

    /// Removes the link for a token.
    pub fn remove(&mut self, token: &Token) -> Option<Arc<HostExtensionLink>> {
        self.links.remove(token)
    }

    /// Returns `true` when the caller owns at least one live link.
    #[must_use]
    pub fn has_caller(&self, caller: &CallerId) -> bool {
        self.links.values().any(|link| link.caller() == caller)
    }

    /// Removes and returns every link owned by the caller.
    pub fn drain_caller(&mut self, caller: &CallerId) -> Vec<Arc<HostExtensionLink>> {
        let tokens: Vec<Token> = self
            .links
            .values()
            .filter(|link| link.caller() == caller)
            .map(|link| link.token())
            .collect();
        tokens
            .iter()
            .filter_map(|token| self.links.remove(token))
            .collect()
    }

    /// Number of live links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns `true` when no links are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

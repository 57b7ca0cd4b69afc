//! Orchestration of extension loads, teardown triggers and diagnostics.
//!
//! [`SandboxManager`] owns the token registry, the link table, the
//! instrumentation set, the loaded-owner bookkeeping, the worker connections
//! and the reconciliation queue. Link table, instrumentation set and loaded
//! bookkeeping share one state lock; the registry and the connections keep
//! their own and are only ever locked after it. The state lock is never held
//! while a collaborator or a host callback is invoked.

mod dump;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, warn};

pub use self::dump::{LoadedSummary, SandboxDump};
use crate::binding::{BindError, DetachedBinding, WorkerConnections};
use crate::error::SandboxError;
use crate::identity::{CallerId, CallerProof};
use crate::link::{
    HostExtensionLink, HostSurface, LinkOwner, LinkTable, LoadCallback, LoadSink, Params,
    SurfaceRequest,
};
use crate::liveness::{DeathNotice, LivenessSource};
use crate::reconcile::{DataDirReconciler, ReconcileError, ReconcileJob, ReconcileQueue};
use crate::resolver::ExtensionResolver;
use crate::supervisor::{LoadRequest, ProcessSupervisor, WorkerComponent, WorkerHandle};
use crate::token::{Token, TokenRegistry};

/// Tracing target for manager operations.
const MANAGER_TARGET: &str = "sandbox_manager::manager";

/// Component started when no worker service is configured.
pub const DEFAULT_WORKER_SERVICE: &str = "sandbox.worker.ExtensionHostService";

/// Automatic rebinds allowed per binding when none is configured.
pub const DEFAULT_BIND_RETRY_LIMIT: u32 = 1;

/// Tunables for a [`SandboxManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    worker_service: String,
    bind_retry_limit: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            worker_service: String::from(DEFAULT_WORKER_SERVICE),
            bind_retry_limit: DEFAULT_BIND_RETRY_LIMIT,
        }
    }
}

impl ManagerSettings {
    /// Sets the worker component started for each caller.
    #[must_use]
    pub fn with_worker_service(mut self, service: impl Into<String>) -> Self {
        self.worker_service = service.into();
        self
    }

    /// Sets the number of automatic rebinds after a binding dies.
    #[must_use]
    pub const fn with_bind_retry_limit(mut self, limit: u32) -> Self {
        self.bind_retry_limit = limit;
        self
    }

    /// Worker component started for each caller.
    #[must_use]
    pub fn worker_service(&self) -> &str {
        self.worker_service.as_str()
    }

    /// Automatic rebinds after a binding dies.
    #[must_use]
    pub const fn bind_retry_limit(&self) -> u32 {
        self.bind_retry_limit
    }
}

/// External services the manager drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Starts, binds and kills worker processes.
    pub supervisor: Arc<dyn ProcessSupervisor>,
    /// Looks up extension metadata.
    pub resolver: Arc<dyn ExtensionResolver>,
    /// Reports callers becoming unreachable.
    pub liveness: Arc<dyn LivenessSource>,
    /// Reconciles per-caller data directories.
    pub reconciler: Arc<dyn DataDirReconciler>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ManagerState {
    links: LinkTable,
    instrumented: BTreeSet<CallerId>,
    loaded: HashMap<CallerId, HashMap<Token, u32>>,
    watched: BTreeSet<CallerId>,
}

struct Shared {
    tokens: TokenRegistry,
    state: Mutex<ManagerState>,
    connections: WorkerConnections,
    supervisor: Arc<dyn ProcessSupervisor>,
    resolver: Arc<dyn ExtensionResolver>,
    liveness: Arc<dyn LivenessSource>,
    reconcile: ReconcileQueue,
}

/// Loads extensions into per-caller worker processes and brokers their links.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct SandboxManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for SandboxManager {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SandboxManager")
            .field("connections", &self.shared.connections)
            .field("tokens", &self.shared.tokens.len())
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Builds a manager and starts its reconciliation queue.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Spawn`] when the queue's thread cannot be
    /// started.
    pub fn new(
        settings: &ManagerSettings,
        collaborators: Collaborators,
    ) -> Result<Self, ReconcileError> {
        let reconcile = ReconcileQueue::start(collaborators.reconciler)?;
        let connections = WorkerConnections::new(
            Arc::clone(&collaborators.supervisor),
            WorkerComponent::new(settings.worker_service()),
            settings.bind_retry_limit(),
        );
        info!(
            target: MANAGER_TARGET,
            worker_service = settings.worker_service(),
            bind_retry_limit = settings.bind_retry_limit(),
            "sandbox manager started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                tokens: TokenRegistry::new(),
                state: Mutex::new(ManagerState::default()),
                connections,
                supervisor: collaborators.supervisor,
                resolver: collaborators.resolver,
                liveness: collaborators.liveness,
                reconcile,
            }),
        })
    }

    /// Loads `name` into the caller's worker.
    ///
    /// The outcome of an accepted request is delivered to `callback`, possibly
    /// on another thread and possibly before this call returns.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Security`] when `proof` does not match
    /// `caller`, or while an instrumentation run is active for `caller`.
    pub fn load_extension(
        &self,
        caller: &CallerId,
        proof: CallerProof,
        name: &str,
        params: Params,
        callback: Arc<dyn LoadCallback>,
    ) -> Result<(), SandboxError> {
        if !proof.vouches_for(caller) {
            warn!(
                target: MANAGER_TARGET,
                caller = %caller,
                observed_uid = proof.uid(),
                "rejecting load with a mismatched caller identity"
            );
            return Err(SandboxError::identity_mismatch(caller, proof));
        }

        let owner: Weak<dyn LinkOwner> = Arc::downgrade(&self.shared) as Weak<dyn LinkOwner>;
        let registration = {
            let mut state = self.shared.lock();
            if state.instrumented.contains(caller) {
                warn!(
                    target: MANAGER_TARGET,
                    caller = %caller,
                    extension = name,
                    "rejecting load during instrumentation"
                );
                return Err(SandboxError::instrumentation_active(caller));
            }
            let token = self.shared.tokens.get_or_create(caller, name);
            let link = Arc::new(HostExtensionLink::new(
                token,
                caller.clone(),
                name,
                Arc::clone(&callback),
                owner,
            ));
            state.links.register(Arc::clone(&link)).map(|()| link)
        };

        let link = match registration {
            Ok(link) => link,
            Err(error) => {
                debug!(
                    target: MANAGER_TARGET,
                    caller = %caller,
                    extension = name,
                    "extension already loaded for caller"
                );
                callback.load_failed(error);
                return Ok(());
            }
        };

        self.shared.start_load(&link, params);
        Ok(())
    }

    /// Forwards a surface request to the extension behind `token`.
    ///
    /// Delivery failures are logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Security`] when `token` has no live link.
    pub fn request_surface(
        &self,
        token: &Token,
        host_surface: HostSurface,
        display_id: u32,
        params: Params,
    ) -> Result<(), SandboxError> {
        let found = self.shared.lock().links.get(token).cloned();
        let Some(link) = found else {
            warn!(
                target: MANAGER_TARGET,
                token = %token,
                "surface request for an unknown token"
            );
            return Err(SandboxError::invalid_token());
        };

        link.request_surface(SurfaceRequest {
            host_surface,
            display_id,
            params,
        });
        Ok(())
    }

    /// Tears down every session of a caller that became unreachable.
    pub fn on_caller_death(&self, token: &Token, caller: &CallerId) {
        self.shared.on_caller_death(token, caller);
    }

    /// Suspends loads for `caller` and kills its worker.
    ///
    /// Repeated notifications are harmless. A data-directory reconciliation
    /// for the caller is queued.
    pub fn notify_instrumentation_started(&self, caller: &CallerId) {
        let newly_added = self.shared.lock().instrumented.insert(caller.clone());
        info!(
            target: MANAGER_TARGET,
            caller = %caller,
            newly_added,
            "instrumentation started"
        );
        self.shared.teardown_caller(caller);
        self.shared
            .reconcile
            .submit(ReconcileJob::Caller(caller.clone()));
    }

    /// Lifts the instrumentation block for `caller`.
    ///
    /// No worker is started until the next load asks for one.
    pub fn notify_instrumentation_finished(&self, caller: &CallerId) {
        let removed = self.shared.lock().instrumented.remove(caller);
        info!(
            target: MANAGER_TARGET,
            caller = %caller,
            removed,
            "instrumentation finished"
        );
    }

    /// Tears down every caller whose worker runs code owned by `owner_uid`.
    pub fn on_package_updating(&self, owner_uid: u32) {
        let affected: Vec<CallerId> = {
            let state = self.shared.lock();
            state
                .loaded
                .iter()
                .filter(|(_, owners)| owners.values().any(|uid| *uid == owner_uid))
                .map(|(caller, _)| caller.clone())
                .collect()
        };

        info!(
            target: MANAGER_TARGET,
            owner_uid,
            affected = affected.len(),
            "package updating"
        );
        for caller in &affected {
            self.shared.teardown_caller(caller);
        }
    }

    /// Queues a reconciliation after a package was added, removed or replaced.
    pub fn on_package_changed(&self, package: &str) {
        debug!(target: MANAGER_TARGET, package, "package changed");
        self.shared
            .reconcile
            .submit(ReconcileJob::Package(package.to_owned()));
    }

    /// Captures the current state for diagnostics.
    #[must_use]
    pub fn dump(&self) -> SandboxDump {
        let (link_count, instrumented, loaded) = {
            let state = self.shared.lock();
            let mut loaded: Vec<LoadedSummary> = state
                .loaded
                .iter()
                .map(|(caller, owners)| {
                    let uids: BTreeSet<u32> = owners.values().copied().collect();
                    LoadedSummary {
                        caller: caller.clone(),
                        owner_uids: uids.into_iter().collect(),
                    }
                })
                .collect();
            loaded.sort_by(|left, right| left.caller.cmp(&right.caller));
            (
                state.links.len(),
                state.instrumented.iter().cloned().collect(),
                loaded,
            )
        };

        SandboxDump {
            token_count: self.shared.tokens.len(),
            link_count,
            bindings: self.shared.connections.snapshot(),
            instrumented,
            loaded,
        }
    }

    /// Stops the reconciliation queue after draining queued jobs.
    pub fn shutdown(&self) {
        self.shared.reconcile.shutdown();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Resolves, watches and dispatches a freshly registered link.
    fn start_load(self: &Arc<Self>, link: &Arc<HostExtensionLink>, params: Params) {
        let caller = link.caller();
        let name = link.name();
        let token = link.token();

        let Some(info) = self.resolver.resolve(name, caller) else {
            link.fail(SandboxError::not_found(
                name,
                "no extension with this name is visible to the caller",
            ));
            return;
        };
        if info.entry_point().is_none() {
            link.fail(SandboxError::not_found(
                name,
                "extension declares no entry point",
            ));
            return;
        }

        let needs_watch = {
            let mut state = self.lock();
            if !state.links.contains(&token) {
                debug!(
                    target: MANAGER_TARGET,
                    token = %token,
                    "session torn down while resolving"
                );
                return;
            }
            state
                .loaded
                .entry(caller.clone())
                .or_default()
                .insert(token, info.owner_uid());
            state.watched.insert(caller.clone())
        };
        if needs_watch && !self.watch(&token, caller) {
            return;
        }

        {
            let state = self.lock();
            if !state.links.contains(&token) || state.instrumented.contains(caller) {
                debug!(
                    target: MANAGER_TARGET,
                    token = %token,
                    "session torn down before the worker was acquired"
                );
                return;
            }
        }

        let request = LoadRequest {
            token,
            caller: caller.clone(),
            extension: info,
            params,
        };
        let pending = Arc::clone(link);
        let shared = Arc::downgrade(self);
        self.connections.acquire(
            caller,
            Box::new(move |outcome| dispatch_load(&shared, outcome, request, &pending)),
        );

        // A teardown between the check above and `acquire` finds no binding to
        // release, so the one `acquire` just created is ours to reclaim.
        if link.is_torn_down() {
            self.reclaim_idle_worker(caller);
        }
    }

    /// Subscribes to the caller's death. Returns `false` when the caller is
    /// already gone, in which case its sessions have been torn down.
    fn watch(self: &Arc<Self>, token: &Token, caller: &CallerId) -> bool {
        let watcher = Arc::downgrade(self);
        let dead_caller = caller.clone();
        let dead_token = *token;
        let notice: DeathNotice = Box::new(move || {
            if let Some(shared) = watcher.upgrade() {
                shared.on_caller_death(&dead_token, &dead_caller);
            }
        });
        if let Err(gone) = self.liveness.watch(caller, notice) {
            warn!(
                target: MANAGER_TARGET,
                caller = %caller,
                error = %gone,
                "caller vanished before its load was dispatched"
            );
            self.on_caller_death(token, caller);
            return false;
        }
        true
    }

    fn on_caller_death(&self, token: &Token, caller: &CallerId) {
        let live = self.tokens.resolve(token).is_some();
        self.lock().watched.remove(caller);
        info!(
            target: MANAGER_TARGET,
            caller = %caller,
            token = %token,
            live,
            "caller died"
        );
        self.teardown_caller(caller);
    }

    /// Drops every session of `caller`, releases its binding and kills the
    /// worker when a binding existed.
    ///
    /// Links, tokens and the binding record change under the state lock, so a
    /// concurrent load either lands before the teardown and is swept with it,
    /// or after it and starts from nothing.
    fn teardown_caller(&self, caller: &CallerId) {
        let (sessions, detached) = {
            let mut state = self.lock();
            state.loaded.remove(caller);
            let drained = state.links.drain_caller(caller);
            for link in &drained {
                link.close();
                self.tokens.destroy(&link.token());
            }
            for token in self.tokens.tokens_for(caller) {
                self.tokens.destroy(&token);
            }
            (drained.len(), self.connections.detach(caller))
        };

        let killed = self.release_worker(caller, detached);
        info!(
            target: MANAGER_TARGET,
            caller = %caller,
            sessions,
            killed,
            "caller torn down"
        );
    }

    /// Releases the caller's worker if a teardown left it serving no session.
    fn reclaim_idle_worker(&self, caller: &CallerId) {
        let detached = {
            let state = self.lock();
            if state.links.has_caller(caller) {
                return;
            }
            self.connections.detach(caller)
        };

        if self.release_worker(caller, detached) {
            info!(
                target: MANAGER_TARGET,
                caller = %caller,
                "reclaimed a worker bound after its caller was torn down"
            );
        }
    }

    /// Unbinds and kills a detached worker. Returns `true` when one existed.
    fn release_worker(&self, caller: &CallerId, detached: Option<DetachedBinding>) -> bool {
        let Some(binding) = detached else {
            return false;
        };
        binding.release();
        self.supervisor.kill(caller);
        true
    }
}

impl LinkOwner for Shared {
    fn release(&self, token: &Token) {
        let mut state = self.lock();
        state.links.remove(token);
        if let Some(key) = self.tokens.resolve(token) {
            let emptied = state.loaded.get_mut(key.caller()).is_some_and(|owners| {
                owners.remove(token);
                owners.is_empty()
            });
            if emptied {
                state.loaded.remove(key.caller());
            }
        }
        self.tokens.destroy(token);
    }
}

fn dispatch_load(
    shared: &Weak<Shared>,
    outcome: Result<Arc<dyn WorkerHandle>, BindError>,
    request: LoadRequest,
    link: &Arc<HostExtensionLink>,
) {
    if link.is_closed() {
        debug!(
            target: MANAGER_TARGET,
            token = %link.token(),
            "session closed before the worker was reached"
        );
        let reclaimer = shared
            .upgrade()
            .filter(|_| outcome.is_ok() && link.is_torn_down());
        if let Some(manager) = reclaimer {
            manager.reclaim_idle_worker(link.caller());
        }
        return;
    }

    let worker = match outcome {
        Ok(worker) => worker,
        Err(error) => {
            warn!(
                target: MANAGER_TARGET,
                token = %link.token(),
                error = %error,
                "could not reach the worker"
            );
            link.fail(SandboxError::internal(format!(
                "failed to bind the worker for {}: {error}",
                link.name()
            )));
            return;
        }
    };

    let sink: Arc<dyn LoadSink> = Arc::clone(link) as Arc<dyn LoadSink>;
    if let Err(error) = worker.load_extension(request, sink) {
        warn!(
            target: MANAGER_TARGET,
            token = %link.token(),
            error = %error,
            "load invocation failed"
        );
        link.fail(SandboxError::internal(format!(
            "failed to invoke the load of {}: {error}",
            link.name()
        )));
    }
}

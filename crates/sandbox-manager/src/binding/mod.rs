//! Per-caller worker bindings on top of the process supervisor.
//!
//! [`WorkerConnections`] keeps at most one [`WorkerBinding`] record per caller
//! and queues loads that arrive while the worker is still starting. Supervisor
//! callbacks arrive on their own threads; every record change happens under
//! the adapter's lock, and the lock is always released before the supervisor
//! or a waiting load is called back.
//!
//! Each bind request carries a generation number. Events from a listener whose
//! generation no longer matches the record are stale and are dropped, so a
//! late `disconnected` from a previous binding cannot clobber a fresh one.
//!
//! When a binding dies while starting, the adapter rebinds automatically up to
//! the configured retry limit. The counter resets once a bind connects.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::identity::CallerId;
use crate::supervisor::{ConnectionListener, ProcessSupervisor, WorkerComponent, WorkerHandle};

/// Tracing target for binding operations.
const BINDING_TARGET: &str = "sandbox_manager::binding";

/// Continuation run once a worker handle is available or binding gave up.
pub type Waiter = Box<dyn FnOnce(Result<Arc<dyn WorkerHandle>, BindError>) + Send>;

/// Reasons a caller's worker could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    /// The supervisor refused the bind request.
    #[error("bind request for {caller} was rejected: {source}")]
    Rejected {
        /// Caller whose worker was requested.
        caller: CallerId,
        /// Supervisor's reason.
        #[source]
        source: SupervisorError,
    },

    /// The binding kept dying while the worker started.
    #[error("worker for {caller} died while binding after {attempts} attempt(s)")]
    Died {
        /// Caller whose worker died.
        caller: CallerId,
        /// Bind attempts made, including the automatic retries.
        attempts: u32,
    },

    /// The worker started but handed out no interface.
    #[error("worker for {caller} returned a null binding")]
    NullBinding {
        /// Caller whose worker misbehaved.
        caller: CallerId,
    },

    /// The binding was released before it connected.
    #[error("binding for {caller} was released before the worker connected")]
    Released {
        /// Caller whose binding was released.
        caller: CallerId,
    },
}

/// Connection state of a caller's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingStatus {
    /// A bind request is outstanding.
    Binding,
    /// The worker is connected.
    Connected,
    /// The worker disconnected and the supervisor is reconnecting.
    Disconnected,
}

impl fmt::Display for BindingStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Binding => "binding",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        formatter.write_str(label)
    }
}

/// Point-in-time view of one binding record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingSnapshot {
    /// Caller owning the worker.
    pub caller: CallerId,
    /// Connection state.
    pub status: BindingStatus,
    /// Loads waiting for the worker.
    pub pending_loads: usize,
    /// Automatic rebinds used since the last successful connect.
    pub retries_used: u32,
}

enum BindingState {
    Binding,
    Connected(Arc<dyn WorkerHandle>),
    Disconnected,
}

impl BindingState {
    const fn status(&self) -> BindingStatus {
        match self {
            Self::Binding => BindingStatus::Binding,
            Self::Connected(_) => BindingStatus::Connected,
            Self::Disconnected => BindingStatus::Disconnected,
        }
    }
}

/// Binding record for one caller's worker.
struct WorkerBinding {
    generation: u64,
    state: BindingState,
    retries_used: u32,
    waiters: Vec<Waiter>,
}

impl WorkerBinding {
    const fn binding(generation: u64) -> Self {
        Self {
            generation,
            state: BindingState::Binding,
            retries_used: 0,
            waiters: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Records {
    next_generation: u64,
    by_caller: HashMap<CallerId, WorkerBinding>,
}

impl Records {
    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn current(&mut self, caller: &CallerId, generation: u64) -> Option<&mut WorkerBinding> {
        self.by_caller
            .get_mut(caller)
            .filter(|record| record.generation == generation)
    }
}

struct ConnectionsInner {
    supervisor: Arc<dyn ProcessSupervisor>,
    component: WorkerComponent,
    retry_limit: u32,
    records: Mutex<Records>,
}

/// Adapter owning one binding record per caller identity.
#[derive(Clone)]
pub struct WorkerConnections {
    inner: Arc<ConnectionsInner>,
}

impl fmt::Debug for WorkerConnections {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WorkerConnections")
            .field("component", &self.inner.component)
            .field("retry_limit", &self.inner.retry_limit)
            .finish_non_exhaustive()
    }
}

enum AcquireAction {
    RunNow(Arc<dyn WorkerHandle>, Waiter),
    Bind(u64),
    Queued,
}

impl WorkerConnections {
    /// Builds an adapter over the supervisor.
    #[must_use]
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        component: WorkerComponent,
        retry_limit: u32,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionsInner {
                supervisor,
                component,
                retry_limit,
                records: Mutex::new(Records::default()),
            }),
        }
    }

    /// Runs `waiter` with the caller's worker, binding it first if needed.
    ///
    /// A connected worker is reused and the waiter runs on the calling
    /// thread. Otherwise the waiter is queued and runs on whichever thread
    /// delivers the supervisor's verdict.
    pub fn acquire(&self, caller: &CallerId, waiter: Waiter) {
        let action = {
            let mut records = self.inner.lock();
            let generation = records.allocate_generation();
            match records.by_caller.get_mut(caller) {
                Some(record) => match &record.state {
                    BindingState::Connected(handle) => {
                        AcquireAction::RunNow(Arc::clone(handle), waiter)
                    }
                    BindingState::Binding | BindingState::Disconnected => {
                        record.waiters.push(waiter);
                        AcquireAction::Queued
                    }
                },
                None => {
                    let mut record = WorkerBinding::binding(generation);
                    record.waiters.push(waiter);
                    records.by_caller.insert(caller.clone(), record);
                    AcquireAction::Bind(generation)
                }
            }
        };

        match action {
            AcquireAction::RunNow(handle, waiter) => waiter(Ok(handle)),
            AcquireAction::Bind(generation) => self.inner.request_bind(caller, generation),
            AcquireAction::Queued => {
                debug!(
                    target: BINDING_TARGET,
                    caller = %caller,
                    "queued load until the worker connects"
                );
            }
        }
    }

    /// Releases the caller's binding and clears its handle.
    ///
    /// Loads still waiting fail with [`BindError::Released`]. Returns `true`
    /// when a record existed; calling this on an unbound caller is a no-op.
    pub fn unbind(&self, caller: &CallerId) -> bool {
        let Some(detached) = self.detach(caller) else {
            return false;
        };
        detached.release();
        true
    }

    /// Removes the caller's record without calling out.
    ///
    /// Safe to call while holding other locks; the supervisor and the waiting
    /// loads are only told once the returned binding is released.
    pub(crate) fn detach(&self, caller: &CallerId) -> Option<DetachedBinding> {
        let record = self.inner.lock().by_caller.remove(caller)?;
        Some(DetachedBinding {
            caller: caller.clone(),
            record,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Current worker handle, if connected.
    #[must_use]
    pub fn get(&self, caller: &CallerId) -> Option<Arc<dyn WorkerHandle>> {
        self.inner
            .lock()
            .by_caller
            .get(caller)
            .and_then(|record| match &record.state {
                BindingState::Connected(handle) => Some(Arc::clone(handle)),
                BindingState::Binding | BindingState::Disconnected => None,
            })
    }

    /// Records `handle` as the caller's connected worker.
    pub fn set(&self, caller: &CallerId, handle: Arc<dyn WorkerHandle>) {
        let waiters = {
            let mut records = self.inner.lock();
            let generation = records.allocate_generation();
            let record = records
                .by_caller
                .entry(caller.clone())
                .or_insert_with(|| WorkerBinding::binding(generation));
            record.state = BindingState::Connected(Arc::clone(&handle));
            record.retries_used = 0;
            mem::take(&mut record.waiters)
        };
        run_waiters(waiters, &handle);
    }

    /// Returns `true` when the caller has a binding record.
    #[must_use]
    pub fn is_bound(&self, caller: &CallerId) -> bool {
        self.inner.lock().by_caller.contains_key(caller)
    }

    /// Snapshot of every binding record, ordered by caller.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BindingSnapshot> {
        let mut snapshots: Vec<BindingSnapshot> = self
            .inner
            .lock()
            .by_caller
            .iter()
            .map(|(caller, record)| BindingSnapshot {
                caller: caller.clone(),
                status: record.state.status(),
                pending_loads: record.waiters.len(),
                retries_used: record.retries_used,
            })
            .collect();
        snapshots.sort_by(|left, right| left.caller.cmp(&right.caller));
        snapshots
    }
}

/// Binding record taken out of the adapter and awaiting release.
#[must_use = "a detached binding must be released"]
pub(crate) struct DetachedBinding {
    caller: CallerId,
    record: WorkerBinding,
    inner: Arc<ConnectionsInner>,
}

impl DetachedBinding {
    /// Tells the supervisor to unbind and fails the loads still waiting.
    pub(crate) fn release(self) {
        info!(
            target: BINDING_TARGET,
            caller = %self.caller,
            status = %self.record.state.status(),
            "releasing worker binding"
        );
        self.inner.supervisor.unbind(&self.caller);
        let error = BindError::Released {
            caller: self.caller,
        };
        fail_waiters(self.record.waiters, &error);
    }
}

impl ConnectionsInner {
    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn request_bind(self: &Arc<Self>, caller: &CallerId, generation: u64) {
        if self.lock().current(caller, generation).is_none() {
            debug!(
                target: BINDING_TARGET,
                caller = %caller,
                generation,
                "binding released before the bind was requested"
            );
            return;
        }

        let listener = Arc::new(BindingListener {
            caller: caller.clone(),
            generation,
            inner: Arc::downgrade(self),
        });

        debug!(
            target: BINDING_TARGET,
            caller = %caller,
            component = %self.component,
            generation,
            "requesting worker binding"
        );
        if let Err(source) = self.supervisor.bind(caller, &self.component, listener) {
            warn!(
                target: BINDING_TARGET,
                caller = %caller,
                error = %source,
                "supervisor rejected bind request"
            );
            let error = BindError::Rejected {
                caller: caller.clone(),
                source,
            };
            self.abandon(caller, generation, &error);
        }
    }

    /// Drops the record for `generation` and fails its waiters.
    fn abandon(&self, caller: &CallerId, generation: u64, error: &BindError) {
        let waiters = {
            let mut records = self.lock();
            if records.current(caller, generation).is_none() {
                return;
            }
            records
                .by_caller
                .remove(caller)
                .map(|record| record.waiters)
                .unwrap_or_default()
        };
        fail_waiters(waiters, error);
    }

    fn on_connected(&self, caller: &CallerId, generation: u64, handle: Arc<dyn WorkerHandle>) {
        let (claimed, orphaned) = {
            let mut records = self.lock();
            let orphaned = !records.by_caller.contains_key(caller);
            let claimed = records.current(caller, generation).map(|record| {
                record.state = BindingState::Connected(Arc::clone(&handle));
                record.retries_used = 0;
                mem::take(&mut record.waiters)
            });
            (claimed, orphaned)
        };
        let Some(waiters) = claimed else {
            self.discard_stale_connection(caller, generation, orphaned);
            return;
        };

        info!(
            target: BINDING_TARGET,
            caller = %caller,
            pending_loads = waiters.len(),
            "worker connected"
        );
        run_waiters(waiters, &handle);
    }

    /// A worker connected for a bind nobody tracks any more. Without a record
    /// for the caller nothing would ever stop it, so it is unbound and killed.
    fn discard_stale_connection(&self, caller: &CallerId, generation: u64, orphaned: bool) {
        if !orphaned {
            debug!(
                target: BINDING_TARGET,
                caller = %caller,
                generation,
                "ignoring connection from a stale binding"
            );
            return;
        }

        warn!(
            target: BINDING_TARGET,
            caller = %caller,
            generation,
            "worker connected after its binding was released; killing it"
        );
        self.supervisor.unbind(caller);
        self.supervisor.kill(caller);
    }

    fn on_disconnected(&self, caller: &CallerId, generation: u64) {
        let mut records = self.lock();
        if let Some(record) = records.current(caller, generation) {
            record.state = BindingState::Disconnected;
            warn!(
                target: BINDING_TARGET,
                caller = %caller,
                "worker disconnected; waiting for the supervisor to reconnect"
            );
        }
    }

    fn on_binding_died(self: &Arc<Self>, caller: &CallerId, generation: u64) {
        enum Verdict {
            Retry(u64),
            GiveUp(Vec<Waiter>, u32),
        }

        let verdict = {
            let mut records = self.lock();
            let retry_generation = records.allocate_generation();
            let retry_limit = self.retry_limit;
            let Some(record) = records.current(caller, generation) else {
                return;
            };
            if record.retries_used < retry_limit {
                record.retries_used += 1;
                record.generation = retry_generation;
                record.state = BindingState::Binding;
                Verdict::Retry(retry_generation)
            } else {
                let attempts = record.retries_used + 1;
                let waiters = mem::take(&mut record.waiters);
                records.by_caller.remove(caller);
                Verdict::GiveUp(waiters, attempts)
            }
        };

        self.supervisor.unbind(caller);
        match verdict {
            Verdict::Retry(retry_generation) => {
                warn!(
                    target: BINDING_TARGET,
                    caller = %caller,
                    "binding died while starting; rebinding"
                );
                self.request_bind(caller, retry_generation);
            }
            Verdict::GiveUp(waiters, attempts) => {
                warn!(
                    target: BINDING_TARGET,
                    caller = %caller,
                    attempts,
                    "binding died again; giving up"
                );
                let error = BindError::Died {
                    caller: caller.clone(),
                    attempts,
                };
                fail_waiters(waiters, &error);
            }
        }
    }

    fn on_null_binding(&self, caller: &CallerId, generation: u64) {
        let waiters = {
            let mut records = self.lock();
            if records.current(caller, generation).is_none() {
                return;
            }
            records
                .by_caller
                .remove(caller)
                .map(|record| record.waiters)
                .unwrap_or_default()
        };

        warn!(
            target: BINDING_TARGET,
            caller = %caller,
            "worker returned a null binding"
        );
        self.supervisor.unbind(caller);
        let error = BindError::NullBinding {
            caller: caller.clone(),
        };
        fail_waiters(waiters, &error);
    }
}

fn run_waiters(waiters: Vec<Waiter>, handle: &Arc<dyn WorkerHandle>) {
    for waiter in waiters {
        waiter(Ok(Arc::clone(handle)));
    }
}

fn fail_waiters(waiters: Vec<Waiter>, error: &BindError) {
    for waiter in waiters {
        waiter(Err(error.clone()));
    }
}

/// Listener handed to the supervisor for one bind generation.
struct BindingListener {
    caller: CallerId,
    generation: u64,
    inner: Weak<ConnectionsInner>,
}

impl ConnectionListener for BindingListener {
    fn connected(&self, worker: Arc<dyn WorkerHandle>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_connected(&self.caller, self.generation, worker);
        }
    }

    fn disconnected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_disconnected(&self.caller, self.generation);
        }
    }

    fn binding_died(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_binding_died(&self.caller, self.generation);
        }
    }

    fn null_binding(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_null_binding(&self.caller, self.generation);
        }
    }
}

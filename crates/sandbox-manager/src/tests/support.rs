//! Recording test doubles for the manager's collaborators.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{RemoteError, SandboxError, SupervisorError};
use crate::identity::CallerId;
use crate::link::{
    ExtensionCallback, LoadCallback, LoadSink, LoadedExtension, Params, SurfaceRequest,
};
use crate::liveness::{CallerGone, DeathNotice, LivenessSource};
use crate::manager::SandboxManager;
use crate::reconcile::{DataDirReconciler, ReconcileError, ReconcileJob};
use crate::resolver::{ExtensionInfo, ExtensionResolver};
use crate::supervisor::{
    ConnectionListener, LoadRequest, ProcessSupervisor, WorkerComponent, WorkerHandle,
};
use crate::token::Token;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

// ---------------------------------------------------------------------------
// Host callback
// ---------------------------------------------------------------------------

/// Outcome observed by a [`RecordingCallback`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Loaded(LoadedExtension),
    Failed(SandboxError),
}

/// Host callback that records every outcome it receives.
#[derive(Debug, Default)]
pub(crate) struct RecordingCallback {
    outcomes: Mutex<Vec<Outcome>>,
}

impl RecordingCallback {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn outcomes(&self) -> Vec<Outcome> {
        lock(&self.outcomes).clone()
    }

    pub(crate) fn last(&self) -> Option<Outcome> {
        lock(&self.outcomes).last().cloned()
    }

    pub(crate) fn loaded(&self) -> Option<LoadedExtension> {
        match self.last() {
            Some(Outcome::Loaded(loaded)) => Some(loaded),
            Some(Outcome::Failed(_)) | None => None,
        }
    }

    pub(crate) fn failure(&self) -> Option<SandboxError> {
        match self.last() {
            Some(Outcome::Failed(error)) => Some(error),
            Some(Outcome::Loaded(_)) | None => None,
        }
    }
}

impl LoadCallback for RecordingCallback {
    fn load_succeeded(&self, loaded: LoadedExtension) {
        lock(&self.outcomes).push(Outcome::Loaded(loaded));
    }

    fn load_failed(&self, error: SandboxError) {
        lock(&self.outcomes).push(Outcome::Failed(error));
    }
}

// ---------------------------------------------------------------------------
// Extension side
// ---------------------------------------------------------------------------

/// Extension callback recording surface requests.
#[derive(Debug, Default)]
pub(crate) struct RecordingExtension {
    requests: Mutex<Vec<SurfaceRequest>>,
    fail: bool,
}

impl RecordingExtension {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub(crate) fn requests(&self) -> Vec<SurfaceRequest> {
        lock(&self.requests).clone()
    }
}

impl ExtensionCallback for RecordingExtension {
    fn surface_requested(&self, request: SurfaceRequest) -> Result<(), RemoteError> {
        lock(&self.requests).push(request);
        if self.fail {
            return Err(RemoteError::new("extension process went away"));
        }
        Ok(())
    }
}

/// How a [`FakeWorker`] answers load requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum WorkerMode {
    /// Report success immediately.
    #[default]
    Succeed,
    /// Report an extension-defined failure immediately.
    ExtensionFails,
    /// Refuse the remote call itself.
    RemoteError,
    /// Accept the call and keep the sink for later.
    Hold,
}

/// Worker handle answering loads according to its [`WorkerMode`].
#[derive(Default)]
pub(crate) struct FakeWorker {
    mode: Mutex<WorkerMode>,
    extension: Arc<RecordingExtension>,
    requests: Mutex<Vec<LoadRequest>>,
    held: Mutex<Vec<Arc<dyn LoadSink>>>,
}

impl FakeWorker {
    pub(crate) fn new(mode: WorkerMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            ..Self::default()
        })
    }

    pub(crate) fn with_extension(mode: WorkerMode, extension: Arc<RecordingExtension>) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            extension,
            ..Self::default()
        })
    }

    pub(crate) fn set_mode(&self, mode: WorkerMode) {
        *lock(&self.mode) = mode;
    }

    pub(crate) fn extension(&self) -> Arc<RecordingExtension> {
        Arc::clone(&self.extension)
    }

    pub(crate) fn requests(&self) -> Vec<LoadRequest> {
        lock(&self.requests).clone()
    }

    /// Completes every held load successfully.
    pub(crate) fn release_held(&self) {
        let sinks: Vec<Arc<dyn LoadSink>> = lock(&self.held).drain(..).collect();
        for sink in sinks {
            let extension: Arc<dyn ExtensionCallback> = self.extension();
            sink.load_succeeded(extension, Params::new());
        }
    }
}

impl WorkerHandle for FakeWorker {
    fn load_extension(
        &self,
        request: LoadRequest,
        sink: Arc<dyn LoadSink>,
    ) -> Result<(), RemoteError> {
        lock(&self.requests).push(request);
        let mode = *lock(&self.mode);
        match mode {
            WorkerMode::Succeed => {
                let extension: Arc<dyn ExtensionCallback> = self.extension();
                let mut info = Params::new();
                info.insert("version".into(), serde_json::Value::from(1));
                sink.load_succeeded(extension, info);
                Ok(())
            }
            WorkerMode::ExtensionFails => {
                sink.load_failed(42, String::from("entry point threw during init"));
                Ok(())
            }
            WorkerMode::RemoteError => Err(RemoteError::new("worker binder is dead")),
            WorkerMode::Hold => {
                lock(&self.held).push(sink);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Call observed by the [`RecordingSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SupervisorCall {
    Bind(CallerId),
    Unbind(CallerId),
    Kill(CallerId),
}

/// Work a test slips in while the supervisor is handling a call.
pub(crate) type Interlude = Box<dyn FnOnce(&CallerId) + Send>;

/// Supervisor double that records calls and optionally auto-connects.
#[derive(Default)]
pub(crate) struct RecordingSupervisor {
    calls: Mutex<Vec<SupervisorCall>>,
    listeners: Mutex<HashMap<CallerId, Arc<dyn ConnectionListener>>>,
    auto_connect: Mutex<Option<Arc<dyn WorkerHandle>>>,
    reject: Mutex<bool>,
    during_bind: Mutex<Option<Interlude>>,
    after_unbind: Mutex<Option<Interlude>>,
}

impl RecordingSupervisor {
    /// Supervisor whose binds wait for the test to drive the listener.
    pub(crate) fn manual() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Supervisor that connects every bind to `worker` straight away.
    pub(crate) fn connecting_to(worker: Arc<dyn WorkerHandle>) -> Arc<Self> {
        let supervisor = Self::default();
        *lock(&supervisor.auto_connect) = Some(worker);
        Arc::new(supervisor)
    }

    pub(crate) fn reject_binds(&self) {
        *lock(&self.reject) = true;
    }

    /// Runs `interlude` inside the next bind, before it is accepted.
    pub(crate) fn during_next_bind(&self, interlude: Interlude) {
        *lock(&self.during_bind) = Some(interlude);
    }

    /// Runs `interlude` right after the next unbind is recorded.
    pub(crate) fn after_next_unbind(&self, interlude: Interlude) {
        *lock(&self.after_unbind) = Some(interlude);
    }

    pub(crate) fn calls(&self) -> Vec<SupervisorCall> {
        lock(&self.calls).clone()
    }

    pub(crate) fn count(&self, wanted: &SupervisorCall) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| *call == wanted)
            .count()
    }

    pub(crate) fn bind_count(&self, caller: &CallerId) -> usize {
        self.count(&SupervisorCall::Bind(caller.clone()))
    }

    pub(crate) fn kill_count(&self, caller: &CallerId) -> usize {
        self.count(&SupervisorCall::Kill(caller.clone()))
    }

    /// Latest listener handed over for the caller.
    pub(crate) fn listener(&self, caller: &CallerId) -> Arc<dyn ConnectionListener> {
        lock(&self.listeners)
            .get(caller)
            .cloned()
            .unwrap_or_else(|| panic!("no bind recorded for {caller}"))
    }
}

impl ProcessSupervisor for RecordingSupervisor {
    fn bind(
        &self,
        caller: &CallerId,
        _component: &WorkerComponent,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<(), SupervisorError> {
        lock(&self.calls).push(SupervisorCall::Bind(caller.clone()));
        let interlude = lock(&self.during_bind).take();
        if let Some(interlude) = interlude {
            interlude(caller);
        }
        if *lock(&self.reject) {
            return Err(SupervisorError::new("no worker slots left"));
        }
        lock(&self.listeners).insert(caller.clone(), Arc::clone(&listener));
        let auto = lock(&self.auto_connect).clone();
        if let Some(worker) = auto {
            listener.connected(worker);
        }
        Ok(())
    }

    fn unbind(&self, caller: &CallerId) {
        lock(&self.calls).push(SupervisorCall::Unbind(caller.clone()));
        let interlude = lock(&self.after_unbind).take();
        if let Some(interlude) = interlude {
            interlude(caller);
        }
    }

    fn kill(&self, caller: &CallerId) {
        lock(&self.calls).push(SupervisorCall::Kill(caller.clone()));
    }
}

// ---------------------------------------------------------------------------
// Resolver, liveness, reconciler
// ---------------------------------------------------------------------------

/// Resolver backed by a fixed table.
#[derive(Debug, Default)]
pub(crate) struct TableResolver {
    entries: Mutex<HashMap<String, ExtensionInfo>>,
}

impl TableResolver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn insert(&self, info: ExtensionInfo) {
        lock(&self.entries).insert(info.name().to_owned(), info);
    }
}

impl ExtensionResolver for TableResolver {
    fn resolve(&self, name: &str, _caller: &CallerId) -> Option<ExtensionInfo> {
        lock(&self.entries).get(name).cloned()
    }
}

/// Liveness source whose deaths are triggered by the test.
#[derive(Default)]
pub(crate) struct ManualLiveness {
    watches: Mutex<HashMap<CallerId, Vec<DeathNotice>>>,
    dead: Mutex<Vec<CallerId>>,
}

impl ManualLiveness {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn watch_count(&self, caller: &CallerId) -> usize {
        lock(&self.watches).get(caller).map_or(0, Vec::len)
    }

    /// Marks the caller dead and fires its notices.
    pub(crate) fn kill(&self, caller: &CallerId) {
        lock(&self.dead).push(caller.clone());
        let notices = lock(&self.watches).remove(caller).unwrap_or_default();
        for notice in notices {
            notice();
        }
    }
}

impl LivenessSource for ManualLiveness {
    fn watch(&self, caller: &CallerId, on_death: DeathNotice) -> Result<(), CallerGone> {
        if lock(&self.dead).contains(caller) {
            return Err(CallerGone {
                caller: caller.clone(),
            });
        }
        lock(&self.watches)
            .entry(caller.clone())
            .or_default()
            .push(on_death);
        Ok(())
    }
}

/// What an [`InterruptingLiveness`] does to the manager during a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
    /// An instrumentation run starts for the caller.
    Instrumentation,
    /// The caller dies.
    Death,
}

/// Liveness source that disturbs the manager from inside the first watch,
/// standing in for an event delivered on another thread mid-load.
pub(crate) struct InterruptingLiveness {
    interruption: Interruption,
    manager: Mutex<Option<SandboxManager>>,
}

impl InterruptingLiveness {
    pub(crate) fn new(interruption: Interruption) -> Arc<Self> {
        Arc::new(Self {
            interruption,
            manager: Mutex::new(None),
        })
    }

    /// Interrupts `manager` on the next watch.
    pub(crate) fn arm(&self, manager: &SandboxManager) {
        *lock(&self.manager) = Some(manager.clone());
    }
}

impl LivenessSource for InterruptingLiveness {
    fn watch(&self, caller: &CallerId, _on_death: DeathNotice) -> Result<(), CallerGone> {
        let armed = lock(&self.manager).take();
        if let Some(manager) = armed {
            match self.interruption {
                Interruption::Instrumentation => manager.notify_instrumentation_started(caller),
                Interruption::Death => manager.on_caller_death(&Token::generate(), caller),
            }
        }
        Ok(())
    }
}

/// Reconciler forwarding every job to a channel.
pub(crate) struct ChannelReconciler {
    sender: Mutex<Sender<ReconcileJob>>,
}

impl ChannelReconciler {
    pub(crate) fn new() -> (Arc<Self>, Receiver<ReconcileJob>) {
        let (sender, receiver) = mpsc::channel();
        (
            Arc::new(Self {
                sender: Mutex::new(sender),
            }),
            receiver,
        )
    }
}

impl DataDirReconciler for ChannelReconciler {
    fn reconcile(&self, job: &ReconcileJob) -> Result<(), ReconcileError> {
        lock(&self.sender)
            .send(job.clone())
            .map_err(|_| ReconcileError::failed(job, "test receiver dropped"))
    }
}

//! Test harness utilities for the service bootstrap suites.

use std::ffi::OsString;
use std::sync::{Arc, Mutex};

use mockall::mock;
use ortho_config::{OrthoConfig, OrthoError};

use sandbox_config::Config;
use sandbox_manager::{
    CallerGone, CallerId, Collaborators, ConnectionListener, DataDirReconciler, DeathNotice,
    ExtensionInfo, ExtensionResolver, LivenessSource, ProcessSupervisor, ReconcileError,
    ReconcileJob, SandboxDump, SupervisorError, WorkerComponent,
};

use crate::bootstrap::{BootstrapError, ConfigLoader, SandboxService, bootstrap_with};
use crate::health::HealthReporter;

mock! {
    pub Supervisor {}
    impl ProcessSupervisor for Supervisor {
        fn bind(
            &self,
            caller: &CallerId,
            component: &WorkerComponent,
            listener: Arc<dyn ConnectionListener>,
        ) -> Result<(), SupervisorError>;
        fn unbind(&self, caller: &CallerId);
        fn kill(&self, caller: &CallerId);
    }
}

/// Resolver that knows a single extension.
pub struct SingleResolver;

impl ExtensionResolver for SingleResolver {
    fn resolve(&self, name: &str, _caller: &CallerId) -> Option<ExtensionInfo> {
        (name == "weather").then(|| {
            ExtensionInfo::new("weather", "com.vendor.weather", 20_001)
                .with_entry_point("WeatherEntry")
        })
    }
}

/// Liveness source whose callers never die.
pub struct ImmortalCallers;

impl LivenessSource for ImmortalCallers {
    fn watch(&self, _caller: &CallerId, _on_death: DeathNotice) -> Result<(), CallerGone> {
        Ok(())
    }
}

/// Reconciler that accepts every job.
pub struct AcceptingReconciler;

impl DataDirReconciler for AcceptingReconciler {
    fn reconcile(&self, _job: &ReconcileJob) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Collaborators around the given supervisor.
pub fn collaborators(supervisor: MockSupervisor) -> Collaborators {
    Collaborators {
        supervisor: Arc::new(supervisor),
        resolver: Arc::new(SingleResolver),
        liveness: Arc::new(ImmortalCallers),
        reconciler: Arc::new(AcceptingReconciler),
    }
}

/// Loader that intentionally fails by passing an unparsable CLI flag.
pub struct FailingConfigLoader;

impl ConfigLoader for FailingConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        let args = vec![
            OsString::from("sandbox-service"),
            OsString::from("--bind-retry-limit"),
            OsString::from("many"),
        ];
        Config::load_from_iter(args)
    }
}

/// Structured health events tracked during tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HealthEvent {
    /// Bootstrap started.
    BootstrapStarting,
    /// Bootstrap completed successfully.
    BootstrapSucceeded,
    /// Bootstrap failed with an error description.
    BootstrapFailed(String),
    /// A state dump was reported with this many live tokens.
    StateReported(usize),
    /// The service stopped.
    ShutdownCompleted,
}

/// Records health events for assertions.
#[derive(Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn state_reported(&self, dump: &SandboxDump) {
        self.record(HealthEvent::StateReported(dump.token_count));
    }

    fn shutdown_completed(&self) {
        self.record(HealthEvent::ShutdownCompleted);
    }
}

/// Runs bootstrap with a recording reporter and an idle supervisor.
pub fn bootstrap(
    loader: &dyn ConfigLoader,
) -> (
    Arc<RecordingHealthReporter>,
    Result<SandboxService, BootstrapError>,
) {
    let reporter = Arc::new(RecordingHealthReporter::default());
    let result = bootstrap_with(
        loader,
        Arc::clone(&reporter) as Arc<dyn HealthReporter>,
        collaborators(MockSupervisor::new()),
    );
    (reporter, result)
}

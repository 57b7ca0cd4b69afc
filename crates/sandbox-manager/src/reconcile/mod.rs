//! Serial background queue for data-directory reconciliation.
//!
//! Reconciliation is delegated to an external [`DataDirReconciler`]. Jobs are
//! submitted from caller threads and executed one at a time, in submission
//! order, on a dedicated worker thread, so the public contract never waits on
//! filesystem work.

use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, warn};

use crate::identity::CallerId;

/// Tracing target for reconciliation.
const RECONCILE_TARGET: &str = "sandbox_manager::reconcile";

/// Unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileJob {
    /// Reconcile the data directories of one caller.
    Caller(CallerId),
    /// Reconcile after a package was added, removed or replaced.
    Package(String),
}

impl fmt::Display for ReconcileJob {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller(caller) => write!(formatter, "caller {caller}"),
            Self::Package(package) => write!(formatter, "package {package}"),
        }
    }
}

/// Errors raised by reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The background worker thread could not be started.
    #[error("failed to start the reconciliation worker: {source}")]
    Spawn {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A job failed.
    #[error("reconciliation of {job} failed: {message}")]
    Failed {
        /// Job that failed.
        job: ReconcileJob,
        /// Failure description.
        message: String,
    },
}

impl ReconcileError {
    /// Builds a [`ReconcileError::Failed`] for `job`.
    #[must_use]
    pub fn failed(job: &ReconcileJob, message: impl Into<String>) -> Self {
        Self::Failed {
            job: job.clone(),
            message: message.into(),
        }
    }
}

/// Performs data-directory reconciliation.
pub trait DataDirReconciler: Send + Sync {
    /// Runs one job.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when the job fails. Failures are logged by
    /// the queue and do not stop later jobs.
    fn reconcile(&self, job: &ReconcileJob) -> Result<(), ReconcileError>;
}

/// Dedicated serial queue running reconciliation jobs.
pub struct ReconcileQueue {
    sender: Mutex<Option<Sender<ReconcileJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ReconcileQueue {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ReconcileQueue")
            .field("running", &lock(&self.sender).is_some())
            .finish()
    }
}

impl ReconcileQueue {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Spawn`] when the thread cannot be created.
    pub fn start(reconciler: Arc<dyn DataDirReconciler>) -> Result<Self, ReconcileError> {
        let (sender, receiver) = mpsc::channel::<ReconcileJob>();
        let worker = thread::Builder::new()
            .name(String::from("sandbox-reconcile"))
            .spawn(move || {
                for job in receiver {
                    debug!(target: RECONCILE_TARGET, job = %job, "reconciling");
                    if let Err(error) = reconciler.reconcile(&job) {
                        warn!(
                            target: RECONCILE_TARGET,
                            job = %job,
                            error = %error,
                            "reconciliation failed"
                        );
                    }
                }
            })
            .map_err(|source| ReconcileError::Spawn { source })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueues a job. Returns `false` once the queue has shut down.
    pub fn submit(&self, job: ReconcileJob) -> bool {
        let guard = lock(&self.sender);
        let Some(sender) = guard.as_ref() else {
            warn!(target: RECONCILE_TARGET, job = %job, "queue stopped; dropping job");
            return false;
        };
        sender.send(job).is_ok()
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub fn shutdown(&self) {
        drop(lock(&self.sender).take());
        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                warn!(target: RECONCILE_TARGET, "reconciliation worker panicked");
            }
        }
    }
}

impl Drop for ReconcileQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

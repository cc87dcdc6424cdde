//! Owning-context dispatch.
//!
//! Every observable mutation (state, progress, events) is routed through a
//! [`Dispatcher`]. Worker tasks never touch observable state directly; they
//! post a job and the dispatcher runs it on the context that owns the
//! component, so observers always see changes in one consistent order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A unit of work to run on the owning context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs on the context that owns a component or updater.
pub trait Dispatcher: Send + Sync {
    /// Queue `job` for execution on the owning context.
    ///
    /// Jobs posted from a single thread run in the order they were posted.
    fn post(&self, job: Job);
}

/// Runs every job inline on the calling thread.
///
/// Suitable when the host is already serialised, e.g. a single task that
/// both drives and observes the update.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDispatcher;

impl ImmediateDispatcher {
    pub fn shared() -> Arc<dyn Dispatcher> {
        Arc::new(ImmediateDispatcher)
    }
}

impl Dispatcher for ImmediateDispatcher {
    fn post(&self, job: Job) {
        job();
    }
}

/// A dedicated tokio task that runs posted jobs one at a time.
///
/// All components sharing an `EventLoop` have their state changes and
/// observer callbacks delivered on that task.
pub struct EventLoop {
    tx: mpsc::UnboundedSender<Job>,
}

impl EventLoop {
    /// Spawn the loop on the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn spawn() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            debug!("Dispatch loop started");
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!("Dispatch loop stopped");
        });

        Arc::new(Self { tx })
    }
}

impl Dispatcher for EventLoop {
    fn post(&self, job: Job) {
        // A terminal state must never be lost, so if the loop is gone the
        // job runs on the caller instead.
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            warn!("Dispatch loop is closed, running job inline");
            job();
        }
    }
}

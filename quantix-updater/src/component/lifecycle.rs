//! The lifecycle state machine shared by every long-running component.
//!
//! A concrete component (resolver, installer) owns a [`Lifecycle`] and hands
//! it an async body on start. The lifecycle spawns the body, captures its
//! outcome, and publishes state and progress changes through the owning
//! [`Dispatcher`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{is_cancellation, UpdateError};
use crate::observe::{Observers, Subscription};
use crate::progress::Progress;
use crate::sync;

/// State of a component.
///
/// ```text
/// Initializing ─► Started ─┬─► Succeeded
///                          ├─► Failed
///                          └─► Cancelling ─► Cancelled
/// (any) ─► Disposed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Initializing,
    Started,
    Cancelling,
    Cancelled,
    Failed,
    Succeeded,
    Disposed,
}

impl ComponentState {
    /// `Succeeded`, `Failed` or `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComponentState::Succeeded | ComponentState::Failed | ComponentState::Cancelled
        )
    }

    /// `Started` or `Cancelling`.
    pub fn is_running(&self) -> bool {
        matches!(self, ComponentState::Started | ComponentState::Cancelling)
    }
}

/// Change notifications published by a component.
#[derive(Debug, Clone, Copy)]
pub enum ComponentEvent {
    StateChanged(ComponentState),
    ProgressChanged(Progress),
}

struct Snapshot {
    state: ComponentState,
    progress: Progress,
    error: Option<Arc<anyhow::Error>>,
}

struct Shared {
    name: String,
    dispatcher: Arc<dyn Dispatcher>,
    snapshot: Mutex<Snapshot>,
    token: CancellationToken,
    observers: Observers<ComponentEvent>,
}

/// Cloneable handle to a component's state machine.
#[derive(Clone)]
pub struct Lifecycle {
    shared: Arc<Shared>,
}

impl Lifecycle {
    /// Create a lifecycle in `Initializing`. `name` is used in log fields.
    pub fn new(name: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                dispatcher,
                snapshot: Mutex::new(Snapshot {
                    state: ComponentState::Initializing,
                    progress: Progress::ZERO,
                    error: None,
                }),
                token: CancellationToken::new(),
                observers: Observers::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        sync::lock(&self.shared.snapshot)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ComponentState {
        self.lock().state
    }

    pub fn progress(&self) -> Progress {
        self.lock().progress
    }

    /// The error that caused `Failed`, if any.
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.lock().error.clone()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ComponentEvent) + Send + Sync + 'static,
    {
        self.shared.observers.subscribe(handler)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.observers.len()
    }

    /// Start the operation.
    ///
    /// `validation` is the component's own parameter check. Returns false,
    /// without side effects, if validation failed, the component is not in
    /// `Initializing`, or there is no tokio runtime to run the body on.
    pub fn start<F, Fut>(&self, validation: Result<(), String>, body: F) -> bool
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if let Err(reason) = validation {
            warn!(component = %self.name(), reason = %reason, "Refusing to start: invalid parameters");
            return false;
        }

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(component = %self.name(), "Refusing to start: no async runtime");
                return false;
            }
        };

        {
            let mut snapshot = self.lock();
            if snapshot.state != ComponentState::Initializing {
                debug!(component = %self.name(), state = ?snapshot.state, "Start ignored");
                return false;
            }
            snapshot.state = ComponentState::Started;
        }

        info!(component = %self.name(), "Component started");
        self.post_event(ComponentEvent::StateChanged(ComponentState::Started));

        let future = body(OperationContext {
            token: self.shared.token.clone(),
            reporter: self.reporter(),
        });
        let lifecycle = self.clone();
        runtime.spawn(async move {
            let result = future.await;
            let owner = lifecycle.clone();
            lifecycle
                .shared
                .dispatcher
                .post(Box::new(move || owner.complete(result)));
        });

        true
    }

    /// Request cooperative cancellation.
    ///
    /// Returns true if the component is now cancelling (including when it
    /// already was), false if it never started or already terminated.
    pub fn cancel(&self) -> bool {
        {
            let mut snapshot = self.lock();
            match snapshot.state {
                ComponentState::Started => snapshot.state = ComponentState::Cancelling,
                ComponentState::Cancelling | ComponentState::Cancelled => return true,
                _ => return false,
            }
        }

        info!(component = %self.name(), "Cancellation requested");
        self.shared.token.cancel();
        self.post_event(ComponentEvent::StateChanged(ComponentState::Cancelling));
        true
    }

    /// Cancel anything in flight and move to `Disposed`. Safe to repeat.
    pub fn dispose(&self) {
        {
            let mut snapshot = self.lock();
            if snapshot.state == ComponentState::Disposed {
                return;
            }
            snapshot.state = ComponentState::Disposed;
        }

        debug!(component = %self.name(), "Component disposed");
        self.shared.token.cancel();
        self.post_event(ComponentEvent::StateChanged(ComponentState::Disposed));
    }

    /// Report progress from any thread. See [`ProgressReporter::report`].
    pub fn report_progress(&self, value: f64) {
        let progress = Progress::new(value);
        let lifecycle = self.clone();
        self.shared.dispatcher.post(Box::new(move || {
            {
                let mut snapshot = lifecycle.lock();
                if !snapshot.state.is_running() || !snapshot.progress.differs_from(progress) {
                    return;
                }
                snapshot.progress = progress;
            }
            lifecycle
                .shared
                .observers
                .notify(&ComponentEvent::ProgressChanged(progress));
        }));
    }

    /// A cloneable progress sink for worker threads.
    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            lifecycle: self.clone(),
        }
    }

    /// Runs on the owning context once the body has finished.
    fn complete(&self, result: anyhow::Result<()>) {
        let next = {
            let mut snapshot = self.lock();
            let next = match (snapshot.state, result) {
                (ComponentState::Disposed, _) => return,
                (ComponentState::Cancelling, _) => ComponentState::Cancelled,
                (_, Ok(())) => ComponentState::Succeeded,
                (_, Err(e)) if is_cancellation(&e) => ComponentState::Cancelled,
                (_, Err(e)) => {
                    error!(component = %self.name(), error = %format!("{:#}", e), "Component failed");
                    snapshot.error = Some(Arc::new(e));
                    ComponentState::Failed
                }
            };
            snapshot.state = next;
            next
        };

        info!(component = %self.name(), state = ?next, "Component finished");
        self.shared.observers.notify(&ComponentEvent::StateChanged(next));
    }

    fn post_event(&self, event: ComponentEvent) {
        let lifecycle = self.clone();
        self.shared
            .dispatcher
            .post(Box::new(move || lifecycle.shared.observers.notify(&event)));
    }
}

/// Reports progress for a running component. Cheap to clone and safe to
/// move into blocking workers.
#[derive(Clone)]
pub struct ProgressReporter {
    lifecycle: Lifecycle,
}

impl ProgressReporter {
    /// Report a fraction in `[0, 1]` (clamped) or `NaN` for unknown.
    ///
    /// Changes under 0.001, and reports made outside `Started`/`Cancelling`,
    /// are dropped.
    pub fn report(&self, value: f64) {
        self.lifecycle.report_progress(value);
    }
}

/// What a component body sees while it runs.
pub struct OperationContext {
    token: CancellationToken,
    reporter: ProgressReporter,
}

impl OperationContext {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(UpdateError::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), UpdateError> {
        if self.token.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn report_progress(&self, value: f64) {
        self.reporter.report(value);
    }

    pub fn reporter(&self) -> ProgressReporter {
        self.reporter.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ImmediateDispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn lifecycle() -> Lifecycle {
        Lifecycle::new("test", ImmediateDispatcher::shared())
    }

    async fn wait_for(lifecycle: &Lifecycle, state: ComponentState) {
        for _ in 0..200 {
            if lifecycle.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {:?}, still {:?}", state, lifecycle.state());
    }

    #[tokio::test]
    async fn test_success_path() {
        let lc = lifecycle();
        assert!(lc.start(Ok(()), |_| async { Ok(()) }));
        wait_for(&lc, ComponentState::Succeeded).await;
        assert!(lc.error().is_none());
    }

    #[tokio::test]
    async fn test_failure_is_captured() {
        let lc = lifecycle();
        assert!(lc.start(Ok(()), |_| async { Err::<(), _>(anyhow::anyhow!("archive is corrupt")) }));
        wait_for(&lc, ComponentState::Failed).await;
        assert_eq!(lc.error().unwrap().to_string(), "archive is corrupt");
    }

    #[tokio::test]
    async fn test_cancellation_error_is_not_failure() {
        let lc = lifecycle();
        assert!(lc.start(Ok(()), |_| async { Err::<(), anyhow::Error>(UpdateError::Cancelled.into()) }));
        wait_for(&lc, ComponentState::Cancelled).await;
        assert!(lc.error().is_none());
    }

    #[tokio::test]
    async fn test_start_rejected_when_invalid_or_repeated() {
        let lc = lifecycle();
        assert!(!lc.start(Err("missing target".into()), |_| async { Ok(()) }));
        assert_eq!(lc.state(), ComponentState::Initializing);

        let (tx, rx) = oneshot::channel::<()>();
        assert!(lc.start(Ok(()), move |_| async move {
            let _ = rx.await;
            Ok(())
        }));
        assert!(!lc.start(Ok(()), |_| async { Ok(()) }));
        let _ = tx.send(());
        wait_for(&lc, ComponentState::Succeeded).await;
    }

    #[test]
    fn test_start_without_runtime_is_refused() {
        let lc = lifecycle();
        assert!(!lc.start(Ok(()), |_| async { Ok(()) }));
        assert_eq!(lc.state(), ComponentState::Initializing);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let lc = lifecycle();
        assert!(!lc.cancel());

        let cancelling_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancelling_events);
        let _sub = lc.subscribe(move |e| {
            if let ComponentEvent::StateChanged(ComponentState::Cancelling) = e {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(lc.start(Ok(()), |ctx| async move {
            ctx.token().cancelled().await;
            Err::<(), anyhow::Error>(UpdateError::Cancelled.into())
        }));
        assert!(lc.cancel());
        assert!(lc.cancel());
        wait_for(&lc, ComponentState::Cancelled).await;
        assert!(lc.cancel());
        assert_eq!(cancelling_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_progress_coalescing() {
        let lc = lifecycle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = lc.subscribe(move |e| {
            if let ComponentEvent::ProgressChanged(p) = e {
                sink.lock().unwrap().push(p.as_f64());
            }
        });

        // Reports before start are ignored.
        lc.report_progress(0.3);

        let (tx, rx) = oneshot::channel::<()>();
        assert!(lc.start(Ok(()), move |_| async move {
            let _ = rx.await;
            Ok(())
        }));
        lc.report_progress(0.5);
        lc.report_progress(0.5005);
        lc.report_progress(2.0);
        lc.report_progress(f64::NAN);
        let _ = tx.send(());
        wait_for(&lc, ComponentState::Succeeded).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], 0.5);
        assert_eq!(seen[1], 1.0);
        assert!(seen[2].is_nan());
    }

    #[tokio::test]
    async fn test_dispose_is_absorbing() {
        let lc = lifecycle();
        let seen_token = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen_token);
        assert!(lc.start(Ok(()), move |ctx| {
            *slot.lock().unwrap() = Some(ctx.token().clone());
            async { Ok(()) }
        }));
        lc.dispose();
        lc.dispose();
        assert_eq!(lc.state(), ComponentState::Disposed);
        assert!(seen_token.lock().unwrap().as_ref().unwrap().is_cancelled());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lc.state(), ComponentState::Disposed);
        assert!(!lc.cancel());
    }
}

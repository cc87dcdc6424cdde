//! Component contract shared by every pipeline stage.

mod lifecycle;

pub use lifecycle::{
    ComponentEvent, ComponentState, Lifecycle, OperationContext, ProgressReporter,
};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::WaitError;
use crate::observe::Subscription;
use crate::progress::Progress;

/// A cancellable, observable, asynchronous unit of work.
///
/// Implementors compose a [`Lifecycle`] and only have to provide `start`;
/// everything else delegates to the lifecycle by default.
pub trait Component: Send + Sync {
    /// The state machine backing this component.
    fn lifecycle(&self) -> &Lifecycle;

    /// Validate parameters and launch the operation. Only valid in
    /// `Initializing`.
    fn start(&self) -> bool;

    fn cancel(&self) -> bool {
        self.lifecycle().cancel()
    }

    fn dispose(&self) {
        self.lifecycle().dispose()
    }

    fn state(&self) -> ComponentState {
        self.lifecycle().state()
    }

    fn progress(&self) -> Progress {
        self.lifecycle().progress()
    }

    fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.lifecycle().error()
    }

    fn subscribe(&self, handler: Box<dyn Fn(&ComponentEvent) + Send + Sync>) -> Subscription {
        self.lifecycle().subscribe(handler)
    }

    fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    fn is_running(&self) -> bool {
        self.state().is_running()
    }
}

/// Start `component` if needed and wait for it to finish.
///
/// Returns the final state (`Succeeded`, `Cancelled` or `Disposed`), or an
/// error if it refused to start, failed, or `token` fired first. Firing
/// `token` only abandons the wait; the component keeps running until it is
/// cancelled separately.
pub async fn start_and_wait<C>(
    component: &C,
    token: &CancellationToken,
) -> Result<ComponentState, WaitError>
where
    C: Component + ?Sized,
{
    let state = component.state();
    if is_finished(state) {
        return outcome(component, state);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    // Released on every return path when `_subscription` drops.
    let _subscription = component.subscribe(Box::new(move |event: &ComponentEvent| {
        if let ComponentEvent::StateChanged(state) = event {
            let _ = tx.send(*state);
        }
    }));

    if component.state() == ComponentState::Initializing && !component.start() {
        return Err(WaitError::StartRefused);
    }

    loop {
        let state = component.state();
        if is_finished(state) {
            return outcome(component, state);
        }

        tokio::select! {
            _ = token.cancelled() => {
                debug!(state = ?state, "Wait abandoned");
                return Err(WaitError::Abandoned);
            }
            changed = rx.recv() => {
                if changed.is_none() {
                    return Err(WaitError::Abandoned);
                }
            }
        }
    }
}

fn is_finished(state: ComponentState) -> bool {
    state.is_terminal() || state == ComponentState::Disposed
}

fn outcome<C>(component: &C, state: ComponentState) -> Result<ComponentState, WaitError>
where
    C: Component + ?Sized,
{
    if state == ComponentState::Failed {
        let error = component
            .error()
            .unwrap_or_else(|| Arc::new(anyhow::anyhow!("component failed without reporting an error")));
        return Err(WaitError::Failed(error));
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, EventLoop, ImmediateDispatcher};
    use std::time::Duration;

    /// Sleeps for a while, honouring cancellation, then succeeds or fails.
    struct Sleeper {
        lifecycle: Lifecycle,
        delay: Duration,
        fail: bool,
    }

    impl Sleeper {
        fn new(dispatcher: Arc<dyn Dispatcher>, delay: Duration, fail: bool) -> Self {
            Self {
                lifecycle: Lifecycle::new("sleeper", dispatcher),
                delay,
                fail,
            }
        }
    }

    impl Component for Sleeper {
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }

        fn start(&self) -> bool {
            let delay = self.delay;
            let fail = self.fail;
            self.lifecycle.start(Ok(()), move |ctx| async move {
                let outcome: anyhow::Result<()> = tokio::select! {
                    _ = ctx.token().cancelled() => Err(crate::UpdateError::Cancelled.into()),
                    _ = tokio::time::sleep(delay) => {
                        if fail {
                            Err(anyhow::anyhow!("sleeper gave up"))
                        } else {
                            Ok(())
                        }
                    }
                };
                outcome
            })
        }
    }

    #[tokio::test]
    async fn test_wait_for_success() {
        let c = Sleeper::new(ImmediateDispatcher::shared(), Duration::from_millis(10), false);
        let state = start_and_wait(&c, &CancellationToken::new()).await.unwrap();
        assert_eq!(state, ComponentState::Succeeded);
        assert_eq!(c.lifecycle().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_translates_failure() {
        let c = Sleeper::new(EventLoop::spawn(), Duration::from_millis(10), true);
        match start_and_wait(&c, &CancellationToken::new()).await {
            Err(WaitError::Failed(e)) => assert_eq!(e.to_string(), "sleeper gave up"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_terminal() {
        let c = Sleeper::new(ImmediateDispatcher::shared(), Duration::from_millis(1), false);
        start_and_wait(&c, &CancellationToken::new()).await.unwrap();

        let fired = CancellationToken::new();
        fired.cancel();
        let state = start_and_wait(&c, &fired).await.unwrap();
        assert_eq!(state, ComponentState::Succeeded);
    }

    #[tokio::test]
    async fn test_abandoned_wait_leaves_component_running() {
        let c = Sleeper::new(ImmediateDispatcher::shared(), Duration::from_secs(30), false);
        let token = CancellationToken::new();
        let abandon = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            abandon.cancel();
        });

        assert!(matches!(start_and_wait(&c, &token).await, Err(WaitError::Abandoned)));
        assert_eq!(c.state(), ComponentState::Started);
        assert_eq!(c.lifecycle().subscriber_count(), 0);

        assert!(c.cancel());
        let state = start_and_wait(&c, &CancellationToken::new()).await.unwrap();
        assert_eq!(state, ComponentState::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_on_disposed_component() {
        let c = Sleeper::new(ImmediateDispatcher::shared(), Duration::from_millis(1), false);
        c.dispose();
        let state = start_and_wait(&c, &CancellationToken::new()).await.unwrap();
        assert_eq!(state, ComponentState::Disposed);
    }
}

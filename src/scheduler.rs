//! Task scheduling capability shared by every instance of a manager.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;

/// Runs manager work off the caller's thread.
///
/// The manager never blocks on I/O itself: connection attempts, heartbeat sends and delayed
/// reconnects all go through this trait, which lets tests substitute a manual clock.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` as soon as possible, possibly on a worker thread.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Run `task` once after `delay`, unless the returned handle is cancelled (or dropped) first.
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle;

    /// Call `tick` every `period` (first call one period from now) until the handle is cancelled.
    fn schedule_repeating(
        &self,
        period: Duration,
        tick: Box<dyn FnMut() + Send + 'static>,
    ) -> TimerHandle;
}

/// Cancellation handle for work registered with a [`Scheduler`].
///
/// The timer is cancelled when the handle is dropped, so overwriting a stored handle can never
/// leave a second timer running.
#[derive(Default)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Wraps a token that a [`Scheduler`] implementation observes for cancellation.
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// [`Scheduler`] backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Creates a scheduler on the runtime the caller is running in.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(self.handle.spawn(task));
    }

    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        drop(self.handle.spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = sleep(delay) => task.await,
            }
        }));

        TimerHandle::new(token)
    }

    fn schedule_repeating(
        &self,
        period: Duration,
        mut tick: Box<dyn FnMut() + Send + 'static>,
    ) -> TimerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        drop(self.handle.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => tick(),
                }
            }
        }));

        TimerHandle::new(token)
    }
}

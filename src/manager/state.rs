use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::InstanceConfig;
use crate::event::{ConnectionEvent, EventSink};
use crate::reconnect::ReconnectPolicy;
use crate::scheduler::TimerHandle;
use crate::transport::Session;

/// Lifecycle phase of one instance.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Phase {
    /// No session and no retry scheduled
    Disconnected,
    /// `Transport::open` is in flight
    Connecting,
    /// A session is open
    Connected,
    /// Waiting for a scheduled reconnect
    Reconnecting,
    /// The manager has been shut down
    ShuttingDown,
}

impl Phase {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

pub(crate) struct PendingReconnect {
    pub(crate) seq: u64,
    /// Cancels the timer when dropped
    pub(crate) _timer: TimerHandle,
}

/// Mutable runtime record of one instance. Only touched with the instance lock held.
pub(crate) struct ConnectionState {
    pub(crate) phase: Phase,
    /// Present only while `phase` is [`Phase::Connected`]
    pub(crate) session: Option<Arc<dyn Session>>,
    pub(crate) policy: ReconnectPolicy,
    /// At most one per instance
    pub(crate) pending_reconnect: Option<PendingReconnect>,
    /// Cancels the `Transport::open` in flight, if any, when dropped
    pub(crate) in_flight: Option<TimerHandle>,
    /// Bumped whenever an attempt starts or a session is detached. Callbacks carrying an older
    /// value belong to a previous session and are ignored.
    pub(crate) generation: u64,
    pub(crate) next_heartbeat: Option<Instant>,
    timer_seq: u64,
}

impl ConnectionState {
    fn new(policy: ReconnectPolicy) -> Self {
        Self {
            phase: Phase::Disconnected,
            session: None,
            policy,
            pending_reconnect: None,
            in_flight: None,
            generation: 0,
            next_heartbeat: None,
            timer_seq: 0,
        }
    }

    /// Enters [`Phase::Connecting`] for a fresh attempt.
    ///
    /// Returns the attempt's generation and a token that is cancelled once the attempt is
    /// abandoned.
    pub(crate) fn begin_attempt(&mut self) -> (u64, CancellationToken) {
        let token = CancellationToken::new();
        self.pending_reconnect = None;
        self.in_flight = Some(TimerHandle::new(token.clone()));
        self.generation += 1;
        self.phase = Phase::Connecting;
        (self.generation, token)
    }

    /// Leaves the current session behind, returning it so the caller can close it once the
    /// lock is released. An attempt still in flight is cancelled.
    pub(crate) fn detach(&mut self, phase: Phase) -> Option<Arc<dyn Session>> {
        self.generation += 1;
        self.phase = phase;
        self.in_flight = None;
        self.next_heartbeat = None;
        self.session.take()
    }

    pub(crate) fn next_timer_seq(&mut self) -> u64 {
        self.timer_seq += 1;
        self.timer_seq
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("phase", &self.phase)
            .field("has_session", &self.session.is_some())
            .field("attempts", &self.policy.attempts())
            .field("reconnect_pending", &self.pending_reconnect.is_some())
            .field("connecting", &self.in_flight.is_some())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// One registered instance: its config, its state, and the events waiting to be published.
///
/// Events are queued while the state lock is held, which fixes their order, and handed to the
/// sink by [`Instance::flush`] once it is released. Only one caller drains the queue at a time.
#[derive(Debug)]
pub(crate) struct Instance {
    pub(crate) config: Arc<InstanceConfig>,
    state: Mutex<ConnectionState>,
    outbox: Mutex<VecDeque<ConnectionEvent>>,
    flushing: AtomicBool,
}

impl Instance {
    pub(crate) fn new(config: InstanceConfig) -> Self {
        let policy = ReconnectPolicy::from(&config);

        Self {
            config: Arc::new(config),
            state: Mutex::new(ConnectionState::new(policy)),
            outbox: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        // State stays consistent across a panicking sink, so poisoning is ignored.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `event` behind every event queued before it.
    pub(crate) fn enqueue(&self, event: ConnectionEvent) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }

    /// Publishes queued events in order. Must be called without the state lock held.
    ///
    /// Returns immediately when another caller, possibly further up this stack, is already
    /// draining; that caller picks up whatever was queued meanwhile.
    pub(crate) fn flush(&self, sink: &dyn EventSink) {
        loop {
            if self.flushing.swap(true, Ordering::AcqRel) {
                return;
            }

            while let Some(event) = self.pop() {
                sink.publish(event);
            }
            self.flushing.store(false, Ordering::Release);

            if self.is_drained() {
                return;
            }
        }
    }

    fn pop(&self) -> Option<ConnectionEvent> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn is_drained(&self) -> bool {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use ws_connection_manager::scheduler::{Scheduler, TimerHandle, TokioScheduler};
use ws_connection_manager::transport::{
    CloseStatus, Frame, Payload, Session, SessionEvents, Transport, TransportError,
};
use ws_connection_manager::{ConnectionEvent, Error, Result};

pub const URL_A: &str = "ws://a.test/stream";
pub const URL_B: &str = "ws://b.test/stream";

/// How [`MockTransport::open`] answers for a given url.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    Succeed,
    Fail,
    /// Never completes
    Hang,
    /// Succeeds after the given delay
    Delay(Duration),
}

#[derive(Default)]
struct TransportState {
    behaviors: Mutex<HashMap<String, OpenBehavior>>,
    opens: Mutex<Vec<String>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    /// `open` calls neither finished nor dropped
    pending: Arc<AtomicUsize>,
}

/// Counts an `open` call as pending until it returns or its future is dropped.
struct PendingOpen(Arc<AtomicUsize>);

impl PendingOpen {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for PendingOpen {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport double that records every open and hands out [`MockSession`]s.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, url: &str, behavior: OpenBehavior) {
        self.state
            .behaviors
            .lock()
            .unwrap()
            .insert(url.to_owned(), behavior);
    }

    pub fn open_count(&self, url: &str) -> usize {
        self.state
            .opens
            .lock()
            .unwrap()
            .iter()
            .filter(|opened| *opened == url)
            .count()
    }

    pub fn sessions(&self, url: &str) -> Vec<Arc<MockSession>> {
        self.state
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|session| session.url == url)
            .cloned()
            .collect()
    }

    pub fn last_session(&self, url: &str) -> Arc<MockSession> {
        self.sessions(url).pop().unwrap()
    }

    /// `open` calls still in progress, across every url.
    pub fn pending_opens(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        events: SessionEvents,
    ) -> Result<Arc<dyn Session>> {
        self.state.opens.lock().unwrap().push(url.to_owned());
        let _pending = PendingOpen::enter(&self.state.pending);
        let behavior = self
            .state
            .behaviors
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(OpenBehavior::Succeed);

        match behavior {
            OpenBehavior::Fail => return Err(Error::transport("connection refused")),
            OpenBehavior::Hang => return std::future::pending().await,
            OpenBehavior::Delay(delay) => sleep(delay).await,
            OpenBehavior::Succeed => {}
        }

        let session = Arc::new(MockSession {
            url: url.to_owned(),
            headers: headers.clone(),
            events,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        });
        self.state.sessions.lock().unwrap().push(Arc::clone(&session));

        Ok(session)
    }
}

/// Session double recording every frame written to it.
pub struct MockSession {
    pub url: String,
    pub headers: HashMap<String, String>,
    events: SessionEvents,
    sent: Mutex<Vec<Frame>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl MockSession {
    /// Frames written by callers, heartbeat pings excluded.
    pub fn sent(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| !frame.is_ping())
            .cloned()
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.is_ping())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn receive(&self, payload: Payload) {
        self.events.on_message(payload);
    }

    pub fn remote_close(&self, status: Option<CloseStatus>) {
        self.events.on_close(status);
    }

    pub fn remote_error(&self, reason: &str) {
        self.events.on_error(Error::transport(reason));
    }
}

#[async_trait]
impl Session for MockSession {
    async fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed.into());
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::transport("broken pipe"));
        }

        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ManualTimer {
    delay: Duration,
    token: CancellationToken,
    task: Option<BoxFuture<'static, ()>>,
}

/// Scheduler whose one-shot timers only fire when the test says so.
///
/// `spawn` and repeating ticks run on tokio as usual.
pub struct ManualScheduler {
    tokio: TokioScheduler,
    timers: Mutex<Vec<ManualTimer>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tokio: TokioScheduler::new(),
            timers: Mutex::new(Vec::new()),
        })
    }

    /// Delays of every timer ever scheduled, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .map(|timer| timer.delay)
            .collect()
    }

    pub fn scheduled(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    /// Timers neither cancelled nor fired.
    pub fn live(&self) -> usize {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .filter(|timer| timer.task.is_some() && !timer.token.is_cancelled())
            .count()
    }

    /// Fires the oldest live timer. Returns `false` when there is none.
    pub fn fire_next(&self) -> bool {
        let task = {
            let mut timers = self.timers.lock().unwrap();
            timers
                .iter_mut()
                .find(|timer| timer.task.is_some() && !timer.token.is_cancelled())
                .and_then(|timer| timer.task.take())
        };

        match task {
            Some(task) => {
                tokio::spawn(task);
                true
            }
            None => false,
        }
    }
}

impl Scheduler for ManualScheduler {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.tokio.spawn(task);
    }

    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let token = CancellationToken::new();
        self.timers.lock().unwrap().push(ManualTimer {
            delay,
            token: token.clone(),
            task: Some(task),
        });
        TimerHandle::new(token)
    }

    fn schedule_repeating(
        &self,
        period: Duration,
        tick: Box<dyn FnMut() + Send + 'static>,
    ) -> TimerHandle {
        self.tokio.schedule_repeating(period, tick)
    }
}

pub fn event_channel() -> (
    mpsc::UnboundedSender<ConnectionEvent>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    mpsc::unbounded_channel()
}

/// Next event, failing the test after two seconds.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Drains everything published so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Lets spawned tasks run without advancing time meaningfully.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub fn tracing_init() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

pub async fn within<F: Future>(future: F) -> F::Output {
    timeout(Duration::from_secs(1), future)
        .await
        .expect("operation blocked")
}

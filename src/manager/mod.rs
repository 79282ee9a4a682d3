//! Connection orchestration.
//!
//! [`ConnectionManager`] owns every configured instance and drives each one through its
//! [`Phase`]s:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──open ok──▶ Connected
//!      ▲                          │                      │
//!      │                      open failed        error / remote close
//!      │                          ▼                      ▼
//!      └──attempts exhausted── (disconnection handler) ◀─┘
//!                                 │
//!                      auto reconnect & budget left
//!                                 ▼
//!                            Reconnecting ──timer──▶ Connecting
//! ```
//!
//! Each instance's state sits behind its own lock, so instances never contend with each other.
//! The lock is only ever held for bookkeeping: opening, sending and closing sessions all happen
//! outside of it, and through the [`Scheduler`] when the caller should not wait for them.

mod heartbeat;
mod state;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use backoff::backoff::Backoff as _;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use self::state::Phase;
use self::state::{Instance, PendingReconnect};
use crate::Result;
use crate::config::InstanceConfig;
use crate::error::Error;
use crate::event::{ConnectionEvent, DisconnectCause, EventSink};
use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};
use crate::transport::{Frame, Payload, Session, SessionEvent, SessionEvents, Transport};

type InstanceMap = HashMap<String, Instance>;

/// Manages a fixed set of named outbound connections.
///
/// Every enabled instance is connected in the background as soon as the manager is built. Lost
/// connections are retried according to their [`InstanceConfig`], connected instances are kept
/// alive with periodic pings, and lifecycle changes plus inbound messages are published to the
/// [`EventSink`].
///
/// Cloning is cheap; clones share the same instances.
///
/// # Example
///
/// ```rust, no_run
/// use ws_connection_manager::transport::tungstenite::TungsteniteTransport;
/// use ws_connection_manager::{ConnectionEvent, ConnectionManager, InstanceConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let (events, mut rx) = tokio::sync::broadcast::channel::<ConnectionEvent>(64);
///     let manager = ConnectionManager::new(
///         vec![InstanceConfig::builder().id("feed").url("wss://example.com/feed").build()],
///         TungsteniteTransport,
///         events,
///     )?;
///
///     while let Ok(event) = rx.recv().await {
///         if let ConnectionEvent::Connected { id, .. } = event {
///             manager.send_message(&id, "hello").await?;
///             break;
///         }
///     }
///
///     manager.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    instances: InstanceMap,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn EventSink>,
    closed: AtomicBool,
    /// Shared heartbeat tick, absent when no instance has a heartbeat
    heartbeat: Mutex<Option<TimerHandle>>,
}

impl ConnectionManager {
    /// Create a manager on the current tokio runtime and start connecting every enabled instance.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new<T, E>(instances: Vec<InstanceConfig>, transport: T, sink: E) -> Result<Self>
    where
        T: Transport,
        E: EventSink,
    {
        Self::with_scheduler(
            instances,
            Arc::new(transport),
            Arc::new(sink),
            Arc::new(TokioScheduler::new()),
        )
    }

    /// Create a manager with an explicit [`Scheduler`].
    ///
    /// Fails with [`Kind::Configuration`](crate::error::Kind::Configuration) when an id is empty
    /// or duplicated, or a url is missing or invalid. Never waits on the network.
    pub fn with_scheduler(
        instances: Vec<InstanceConfig>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        let mut map = InstanceMap::with_capacity(instances.len());
        for config in instances {
            config.validate()?;
            if map.contains_key(&config.id) {
                return Err(Error::configuration(format!(
                    "duplicate instance id '{}'",
                    config.id
                )));
            }
            map.insert(config.id.clone(), Instance::new(config));
        }

        let period = heartbeat::period(&map);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let heartbeat =
                period.map(|period| heartbeat::start(scheduler.as_ref(), period, weak.clone()));

            Inner {
                instances: map,
                transport,
                scheduler,
                sink,
                closed: AtomicBool::new(false),
                heartbeat: Mutex::new(heartbeat),
            }
        });

        #[cfg(feature = "tracing")]
        tracing::info!(
            instances = inner.instances.len(),
            heartbeat_period = ?period,
            "Connection manager started"
        );

        for instance in inner.instances.values() {
            if instance.config.enabled {
                inner.connect(&instance.config.id, false)?;
            }
        }

        Ok(Self { inner })
    }

    /// Start connecting `id` in the background.
    ///
    /// A no-op while the instance is already connecting or connected. Otherwise any scheduled
    /// reconnect is cancelled, the attempt budget is restored, and a new attempt starts.
    pub fn connect(&self, id: &str) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.connect(id, true)
    }

    /// Close the session of `id` and stop retrying it until the next [`Self::connect`].
    ///
    /// A pending reconnect or an in-flight attempt is cancelled before this returns, even when
    /// the instance was not connected.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        self.inner.ensure_open()?;
        let instance = self.inner.instance(id)?;

        let session = {
            let mut state = instance.lock();
            if state.phase == Phase::ShuttingDown {
                return Err(Error::manager_closed());
            }

            state.pending_reconnect = None;
            let session = state.detach(Phase::Disconnected);
            if session.is_some() {
                Inner::queue_disconnected(instance, DisconnectCause::Manual);
            }
            session
        };
        instance.flush(self.inner.sink.as_ref());

        let Some(session) = session else {
            #[cfg(feature = "tracing")]
            tracing::debug!(id = %id, "Disconnect requested while not connected");
            return Ok(());
        };

        #[cfg(feature = "tracing")]
        tracing::info!(id = %id, "Disconnected by caller");

        session.close().await
    }

    /// Send `payload` on the session of `id`.
    ///
    /// A failed write tears the connection down (scheduling a reconnect when configured) and the
    /// error is returned to the caller.
    pub async fn send_message<P: Into<Payload>>(&self, id: &str, payload: P) -> Result<()> {
        let frame = Frame::from(payload.into());
        self.inner.ensure_open()?;
        let instance = self.inner.instance(id)?;

        let (session, generation) = {
            let state = instance.lock();
            match (state.phase, &state.session) {
                (Phase::Connected, Some(session)) => (Arc::clone(session), state.generation),
                _ => return Err(Error::not_connected(id)),
            }
        };

        if let Err(e) = session.send(frame).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(id = %id, error = %e, "Send failed");

            self.inner
                .handle_disconnect(id, generation, DisconnectCause::SendFailed(e.to_string()))
                .await;
            return Err(e);
        }

        Ok(())
    }

    /// Serialize `value` to JSON and send it as a text payload.
    pub async fn send_json<R: Serialize + ?Sized>(&self, id: &str, value: &R) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.send_message(id, json).await
    }

    /// The open session of `id`, if any.
    pub fn session(&self, id: &str) -> Result<Option<Arc<dyn Session>>> {
        self.inner.ensure_open()?;
        let instance = self.inner.instance(id)?;

        let state = instance.lock();
        Ok(state.session.clone())
    }

    /// `false` for unknown ids and after shutdown.
    #[must_use]
    pub fn is_connected(&self, id: &str) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
            && self
                .inner
                .instances
                .get(id)
                .is_some_and(|instance| instance.lock().phase.is_connected())
    }

    #[must_use]
    pub fn instance_ids(&self) -> BTreeSet<String> {
        self.inner.instances.keys().cloned().collect()
    }

    /// Current phase of `id`. Still answers after shutdown.
    pub fn phase(&self, id: &str) -> Result<Phase> {
        let instance = self.inner.instance(id)?;
        Ok(instance.lock().phase)
    }

    /// Consecutive failed attempts since the last successful or manual connect.
    pub fn reconnect_attempts(&self, id: &str) -> Result<u32> {
        let instance = self.inner.instance(id)?;
        Ok(instance.lock().policy.attempts())
    }

    /// Stop everything: cancel reconnects and the heartbeat, close every session.
    ///
    /// Close failures are logged and skipped. Afterwards every operation fails with
    /// [`Kind::ManagerClosed`](crate::error::Kind::ManagerClosed).
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::manager_closed());
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Shutting down connection manager");

        drop(
            self.inner
                .heartbeat
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let mut sessions = Vec::new();
        for instance in self.inner.instances.values() {
            {
                let mut state = instance.lock();
                state.pending_reconnect = None;
                if let Some(session) = state.detach(Phase::ShuttingDown) {
                    Inner::queue_disconnected(instance, DisconnectCause::Shutdown);
                    sessions.push((instance.config.id.clone(), session));
                }
            }
            instance.flush(self.inner.sink.as_ref());
        }

        let closed = join_all(
            sessions
                .into_iter()
                .map(|(id, session)| async move { (id, session.close().await) }),
        )
        .await;

        for (id, result) in closed {
            if let Err(e) = result {
                #[cfg(feature = "tracing")]
                tracing::error!(id = %id, error = %e, "Failed to close session during shutdown");
                #[cfg(not(feature = "tracing"))]
                let _ = (&id, &e);
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("instances", &self.inner.instances)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::manager_closed());
        }
        Ok(())
    }

    fn instance(&self, id: &str) -> Result<&Instance> {
        self.instances
            .get(id)
            .ok_or_else(|| Error::unknown_instance(id))
    }

    fn connect(self: &Arc<Self>, id: &str, manual: bool) -> Result<()> {
        let instance = self.instance(id)?;

        let (generation, cancelled) = {
            let mut state = instance.lock();
            match state.phase {
                Phase::Connecting | Phase::Connected => return Ok(()),
                Phase::ShuttingDown => return Err(Error::manager_closed()),
                Phase::Disconnected | Phase::Reconnecting => {}
            }

            if manual {
                state.policy.reset();
            }
            state.begin_attempt()
        };

        self.spawn_open(instance, generation, cancelled);
        Ok(())
    }

    /// Fired by a reconnect timer; ignored unless that timer is still the pending one.
    fn reconnect_due(self: &Arc<Self>, id: &str, seq: u64) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };

        let (generation, cancelled) = {
            let mut state = instance.lock();
            let current = state
                .pending_reconnect
                .as_ref()
                .is_some_and(|pending| pending.seq == seq);
            if state.phase != Phase::Reconnecting || !current {
                #[cfg(feature = "tracing")]
                tracing::debug!(id = %id, "Ignoring superseded reconnect timer");
                return;
            }
            state.begin_attempt()
        };

        self.spawn_open(instance, generation, cancelled);
    }

    /// Opens a session off the caller's task. Cancelling `cancelled` abandons the open.
    fn spawn_open(
        self: &Arc<Self>,
        instance: &Instance,
        generation: u64,
        cancelled: CancellationToken,
    ) {
        let manager = Arc::downgrade(self);
        let transport = Arc::clone(&self.transport);
        let config = Arc::clone(&instance.config);

        #[cfg(feature = "tracing")]
        tracing::debug!(id = %config.id, url = %config.url, "Connecting");

        self.scheduler.spawn(Box::pin(async move {
            let (events, rx) = SessionEvents::channel();
            let result = tokio::select! {
                () = cancelled.cancelled() => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(id = %config.id, "Connection attempt abandoned");
                    return;
                }
                result = transport.open(&config.url, &config.headers, events) => result,
            };

            if let Some(manager) = manager.upgrade() {
                manager.finish_open(&config.id, generation, result, rx).await;
            } else if let Ok(session) = result {
                _ = session.close().await;
            }
        }));
    }

    async fn finish_open(
        self: &Arc<Self>,
        id: &str,
        generation: u64,
        result: Result<Arc<dyn Session>>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(id = %id, url = %instance.config.url, error = %e, "Unable to connect");

                self.handle_disconnect(id, generation, DisconnectCause::ConnectFailed(e.to_string()))
                    .await;
                return;
            }
        };

        let accepted = {
            let mut state = instance.lock();
            let accepted = state.generation == generation && state.phase == Phase::Connecting;
            if accepted {
                let config = &instance.config;
                state.session = Some(Arc::clone(&session));
                state.phase = Phase::Connected;
                state.policy.reset();
                state.pending_reconnect = None;
                state.in_flight = None;
                state.next_heartbeat = config
                    .heartbeat_enabled()
                    .then(|| Instant::now() + config.heartbeat_interval);

                instance.enqueue(ConnectionEvent::Connected {
                    id: config.id.clone(),
                    url: config.url.clone(),
                });
            }
            accepted
        };
        instance.flush(self.sink.as_ref());

        if accepted {
            #[cfg(feature = "tracing")]
            tracing::info!(id = %id, url = %instance.config.url, "Connected");

            self.spawn_reader(id.to_owned(), generation, events);
        } else {
            #[cfg(feature = "tracing")]
            tracing::debug!(id = %id, "Attempt superseded, closing late session");

            _ = session.close().await;
        }
    }

    /// Drains the session's callbacks until it fails, closes, or is superseded.
    fn spawn_reader(
        self: &Arc<Self>,
        id: String,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let manager = Arc::downgrade(self);

        self.scheduler.spawn(Box::pin(async move {
            let cause = loop {
                let Some(event) = events.recv().await else {
                    break DisconnectCause::RemoteClosed(None);
                };
                let Some(strong) = manager.upgrade() else {
                    return;
                };

                match event {
                    SessionEvent::Message(payload) => {
                        if !strong.deliver(&id, generation, payload) {
                            return;
                        }
                    }
                    SessionEvent::Error(e) => break DisconnectCause::TransportError(e.to_string()),
                    SessionEvent::Closed(status) => break DisconnectCause::RemoteClosed(status),
                }
            };

            if let Some(manager) = manager.upgrade() {
                manager.handle_disconnect(&id, generation, cause).await;
            }
        }));
    }

    /// Publishes an inbound message; `false` once the session is no longer the current one.
    fn deliver(&self, id: &str, generation: u64, payload: Payload) -> bool {
        let Some(instance) = self.instances.get(id) else {
            return false;
        };

        {
            let state = instance.lock();
            if state.generation != generation || state.phase != Phase::Connected {
                return false;
            }

            instance.enqueue(ConnectionEvent::MessageReceived {
                id: instance.config.id.clone(),
                url: instance.config.url.clone(),
                payload,
            });
        }
        instance.flush(self.sink.as_ref());
        true
    }

    /// Disconnection handler: detach and close the session, publish `Disconnected`, then
    /// schedule a reconnect if the instance allows one.
    async fn handle_disconnect(self: &Arc<Self>, id: &str, generation: u64, cause: DisconnectCause) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        let config = &instance.config;

        let session = {
            let mut state = instance.lock();
            if state.generation != generation || state.phase == Phase::ShuttingDown {
                #[cfg(feature = "tracing")]
                tracing::debug!(id = %id, %cause, "Ignoring stale disconnection");
                return;
            }

            let session = state.detach(Phase::Disconnected);
            Self::queue_disconnected(instance, cause.clone());

            if !config.auto_reconnect {
                #[cfg(feature = "tracing")]
                tracing::warn!(id = %id, %cause, "Connection lost, automatic reconnect disabled");
            } else if let Some(delay) = state.policy.next_backoff() {
                let seq = state.next_timer_seq();
                let manager = Arc::downgrade(self);
                let timer_id = id.to_owned();
                let timer = self.scheduler.schedule(
                    delay,
                    Box::pin(async move {
                        if let Some(manager) = manager.upgrade() {
                            manager.reconnect_due(&timer_id, seq);
                        }
                    }),
                );

                // Replacing the previous entry cancels its timer
                state.pending_reconnect = Some(PendingReconnect { seq, _timer: timer });
                state.phase = Phase::Reconnecting;

                #[cfg(feature = "tracing")]
                tracing::warn!(
                    id = %id,
                    %cause,
                    attempt = state.policy.attempts(),
                    max_attempts = state.policy.max_attempts(),
                    strategy = %config.reconnect_strategy,
                    ?delay,
                    "Connection lost, reconnect scheduled"
                );
            } else {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    id = %id,
                    url = %config.url,
                    %cause,
                    attempts = state.policy.attempts(),
                    "Reconnect attempts exhausted, giving up until connect() is called"
                );
            }

            session
        };
        instance.flush(self.sink.as_ref());

        if let Some(session) = session
            && let Err(e) = session.close().await
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(id = %id, error = %e, "Error closing failed session");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    fn queue_disconnected(instance: &Instance, cause: DisconnectCause) {
        instance.enqueue(ConnectionEvent::Disconnected {
            id: instance.config.id.clone(),
            url: instance.config.url.clone(),
            cause,
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Sessions still open when the last handle goes away are closed in the background.
        for instance in self.instances.values() {
            let mut state = instance.lock();
            state.pending_reconnect = None;
            if let Some(session) = state.detach(Phase::ShuttingDown) {
                self.scheduler.spawn(Box::pin(async move {
                    _ = session.close().await;
                }));
            }
        }
    }
}

//! Lifecycle and message events published by the manager.

use std::fmt;

use tokio::sync::{broadcast, mpsc};

use crate::transport::{CloseStatus, Payload};

/// Why an instance left the connected (or connecting) state.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// `Transport::open` failed
    ConnectFailed(String),
    /// The session reported an error
    TransportError(String),
    /// The remote side closed the session
    RemoteClosed(Option<CloseStatus>),
    /// A heartbeat ping could not be written
    HeartbeatFailed(String),
    /// A caller's send could not be written
    SendFailed(String),
    /// [`ConnectionManager::disconnect`](crate::ConnectionManager::disconnect) was called
    Manual,
    /// The manager is shutting down
    Shutdown,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed(reason) => write!(f, "connect failed: {reason}"),
            Self::TransportError(reason) => write!(f, "transport error: {reason}"),
            Self::RemoteClosed(Some(status)) => write!(f, "closed by remote: {status}"),
            Self::RemoteClosed(None) => write!(f, "closed by remote"),
            Self::HeartbeatFailed(reason) => write!(f, "heartbeat failed: {reason}"),
            Self::SendFailed(reason) => write!(f, "send failed: {reason}"),
            Self::Manual => write!(f, "disconnected by caller"),
            Self::Shutdown => write!(f, "manager shutting down"),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        id: String,
        url: String,
    },
    Disconnected {
        id: String,
        url: String,
        cause: DisconnectCause,
    },
    MessageReceived {
        id: String,
        url: String,
        payload: Payload,
    },
}

impl ConnectionEvent {
    /// Id of the instance the event belongs to.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Connected { id, .. }
            | Self::Disconnected { id, .. }
            | Self::MessageReceived { id, .. } => id,
        }
    }
}

/// Consumer-facing publication point for [`ConnectionEvent`]s.
///
/// Events of one instance arrive in transition order. `publish` runs after the instance's state
/// lock is released, so an implementation may query the manager (`is_connected`, `phase`, ...)
/// from inside it. Implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: ConnectionEvent);
}

/// Fan-out to every live receiver. Events are dropped while nobody is subscribed.
impl EventSink for broadcast::Sender<ConnectionEvent> {
    fn publish(&self, event: ConnectionEvent) {
        _ = self.send(event);
    }
}

impl EventSink for mpsc::UnboundedSender<ConnectionEvent> {
    fn publish(&self, event: ConnectionEvent) {
        _ = self.send(event);
    }
}

/// Discards every event.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: ConnectionEvent) {}
}

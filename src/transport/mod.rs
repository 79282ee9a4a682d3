//! Transport capability consumed by the manager.
//!
//! The manager never speaks a wire protocol itself. A [`Transport`] opens [`Session`]s, and the
//! session's callbacks reach the manager through [`SessionEvents`], an explicit channel that the
//! manager drains on its own task. This keeps the manager the only writer of connection state.
//!
//! With the `tungstenite` feature, [`tungstenite::TungsteniteTransport`] provides a WebSocket
//! implementation.
//!
//! # Example
//!
//! ```ignore
//! struct LoopbackTransport;
//!
//! #[async_trait]
//! impl Transport for LoopbackTransport {
//!     async fn open(
//!         &self,
//!         url: &str,
//!         headers: &HashMap<String, String>,
//!         events: SessionEvents,
//!     ) -> Result<Arc<dyn Session>> {
//!         Ok(Arc::new(LoopbackSession { events }))
//!     }
//! }
//! ```

pub mod error;
#[cfg(feature = "tungstenite")]
pub mod tungstenite;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;
use crate::error::Error;
#[expect(
    clippy::module_name_repetitions,
    reason = "TransportError includes module name for clarity when used outside this module"
)]
pub use error::TransportError;

/// Opens sessions to remote endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a session to `url`, sending `headers` with the handshake.
    ///
    /// May take as long as the transport's own connect timeout allows. Inbound traffic and
    /// session failures must be reported through `events` for as long as the session lives.
    async fn open(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        events: SessionEvents,
    ) -> Result<Arc<dyn Session>>;
}

/// A live connection returned by [`Transport::open`].
#[async_trait]
pub trait Session: Send + Sync + 'static {
    async fn send(&self, frame: Frame) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Application data carried by a session.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Self::Binary(data.to_vec())
    }
}

/// Outbound unit handed to [`Session::send`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Keep-alive ping
    Ping(Vec<u8>),
}

impl Frame {
    #[must_use]
    pub const fn is_ping(&self) -> bool {
        matches!(self, Self::Ping(_))
    }
}

impl From<Payload> for Frame {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Self::Text(text),
            Payload::Binary(data) => Self::Binary(data),
        }
    }
}

/// Close code and reason sent by the remote side.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub reason: String,
}

impl CloseStatus {
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// Callback delivered by a session.
#[non_exhaustive]
#[derive(Debug)]
pub enum SessionEvent {
    Message(Payload),
    Error(Error),
    Closed(Option<CloseStatus>),
}

/// Callback handle given to [`Transport::open`].
///
/// Every callback is queued in order; a session that reports an error or a close should not
/// report anything afterwards.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEvents {
    /// Creates a handle together with the receiving end of its queue.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn on_message(&self, payload: Payload) {
        _ = self.tx.send(SessionEvent::Message(payload));
    }

    pub fn on_error(&self, error: Error) {
        _ = self.tx.send(SessionEvent::Error(error));
    }

    pub fn on_close(&self, status: Option<CloseStatus>) {
        _ = self.tx.send(SessionEvent::Closed(status));
    }

    /// Returns `true` once nobody listens to this session any more.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_conversions() {
        assert!(Payload::from("hello").is_text());
        assert_eq!(Payload::from("hello").as_text(), Some("hello"));
        assert_eq!(
            Frame::from(Payload::from(vec![1_u8, 2])),
            Frame::Binary(vec![1, 2])
        );
        assert!(!Payload::from(&b"raw"[..]).is_text());
    }

    #[test]
    fn close_status_display() {
        assert_eq!(CloseStatus::new(1000, "").to_string(), "1000");
        assert_eq!(CloseStatus::new(4000, "bye").to_string(), "4000 (bye)");
    }

    #[test]
    fn session_events_keep_order() {
        let (events, mut rx) = SessionEvents::channel();

        events.on_message(Payload::from("first"));
        events.on_close(None);

        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::Message(Payload::Text(text))) if text == "first"
        ));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Closed(None))));
    }

    #[test]
    fn session_events_detect_dropped_receiver() {
        let (events, rx) = SessionEvents::channel();
        assert!(!events.is_closed());

        drop(rx);
        assert!(events.is_closed());
    }
}

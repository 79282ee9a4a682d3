#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// Transport-level error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the WebSocket server
    #[cfg(feature = "tungstenite")]
    Connection(tokio_tungstenite::tungstenite::Error),
    /// A configured handshake header is not a valid HTTP header
    InvalidHeader {
        /// Name of the offending header
        name: String,
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
    /// The session was already closed
    ConnectionClosed,
    /// Failure reported by a custom transport
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "tungstenite")]
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::InvalidHeader { name, .. } => write!(f, "Invalid handshake header: {name}"),
            Self::ConnectionClosed => write!(f, "Session closed"),
            Self::Other(reason) => write!(f, "{reason}"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            #[cfg(feature = "tungstenite")]
            Self::Connection(e) => Some(e),
            Self::InvalidHeader { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<TransportError> for crate::error::Error {
    fn from(e: TransportError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Transport, e)
    }
}

#[cfg(feature = "tungstenite")]
impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(
            crate::error::Kind::Transport,
            TransportError::Connection(e),
        )
    }
}

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use crate::transport::TransportError;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Invalid instance configuration supplied at construction
    Configuration,
    /// The instance exists but has no open session
    NotConnected,
    /// No instance is registered under the requested id
    UnknownInstance,
    /// The manager has been shut down
    ManagerClosed,
    /// Error opening, writing to or closing a transport session
    Transport,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    #[must_use]
    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn configuration<S: Into<String>>(reason: S) -> Self {
        Configuration {
            reason: reason.into(),
        }
        .into()
    }

    pub fn not_connected<S: Into<String>>(id: S) -> Self {
        NotConnected { id: id.into() }.into()
    }

    pub fn unknown_instance<S: Into<String>>(id: S) -> Self {
        UnknownInstance { id: id.into() }.into()
    }

    #[must_use]
    pub fn manager_closed() -> Self {
        ManagerClosed.into()
    }

    /// Shorthand for a [`TransportError::Other`] failure, mostly useful to custom transports.
    pub fn transport<S: Into<String>>(reason: S) -> Self {
        TransportError::Other(reason.into()).into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Configuration {
    pub reason: String,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl StdError for Configuration {}

#[non_exhaustive]
#[derive(Debug)]
pub struct NotConnected {
    pub id: String,
}

impl fmt::Display for NotConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance '{}' is not connected", self.id)
    }
}

impl StdError for NotConnected {}

#[non_exhaustive]
#[derive(Debug)]
pub struct UnknownInstance {
    pub id: String,
}

impl fmt::Display for UnknownInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no instance registered with id '{}'", self.id)
    }
}

impl StdError for UnknownInstance {}

#[non_exhaustive]
#[derive(Debug)]
pub struct ManagerClosed;

impl fmt::Display for ManagerClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection manager has been shut down")
    }
}

impl StdError for ManagerClosed {}

impl From<Configuration> for Error {
    fn from(err: Configuration) -> Self {
        Error::with_source(Kind::Configuration, err)
    }
}

impl From<NotConnected> for Error {
    fn from(err: NotConnected) -> Self {
        Error::with_source(Kind::NotConnected, err)
    }
}

impl From<UnknownInstance> for Error {
    fn from(err: UnknownInstance) -> Self {
        Error::with_source(Kind::UnknownInstance, err)
    }
}

impl From<ManagerClosed> for Error {
    fn from(err: ManagerClosed) -> Self {
        Error::with_source(Kind::ManagerClosed, err)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Configuration, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

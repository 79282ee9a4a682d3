#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod reconnect;
pub mod scheduler;
pub mod transport;

pub use config::{InstanceConfig, ReconnectStrategy};
pub use error::Error;
pub use event::{ConnectionEvent, DisconnectCause, EventSink};
pub use manager::{ConnectionManager, Phase};

pub type Result<T> = std::result::Result<T, Error>;

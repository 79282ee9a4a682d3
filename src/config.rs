//! Per-instance connection configuration.
//!
//! An [`InstanceConfig`] is immutable once handed to the
//! [`ConnectionManager`](crate::ConnectionManager). Configs are usually built with
//! [`InstanceConfig::builder`], or deserialized through [`Settings`] when they come from a
//! configuration file owned by the host application.

use std::collections::HashMap;
use std::time::Duration;

use bon::Builder;
use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use url::Url;

use crate::Result;
use crate::error::Error;

const DEFAULT_RECONNECT_DELAY_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);

/// Id given to the single-instance shorthand of [`Settings`] when none is configured.
pub const DEFAULT_INSTANCE_ID: &str = "default";

/// How the delay between two reconnection attempts evolves.
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconnectStrategy {
    /// Every attempt waits the configured base delay.
    #[default]
    FixedDelay,
    /// Attempt `n` (0-indexed) waits `base * 2^n`, without an upper bound.
    ExponentialBackoff,
}

/// Immutable description of one named outbound connection.
#[serde_as]
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Builder, Deserialize)]
pub struct InstanceConfig {
    /// Unique key of the instance within one manager
    #[builder(into)]
    pub id: String,
    /// Endpoint the transport opens, e.g. `wss://example.com/stream`
    #[builder(into)]
    pub url: String,
    /// Disabled instances are registered but not connected at startup
    #[builder(default = true)]
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Whether a lost connection is retried automatically
    #[builder(default = true)]
    #[serde(default = "enabled_by_default")]
    pub auto_reconnect: bool,
    #[builder(default)]
    #[serde(default)]
    pub reconnect_strategy: ReconnectStrategy,
    /// Base delay fed into the [`ReconnectStrategy`]
    #[builder(default = DEFAULT_RECONNECT_DELAY_DURATION)]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(
        rename = "reconnect_delay_ms",
        default = "default_reconnect_delay"
    )]
    pub reconnect_delay: Duration,
    /// Consecutive failed connection attempts, the first one included, after which no retry is
    /// scheduled
    #[builder(default = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Interval between keep-alive pings. [`Duration::ZERO`] disables the heartbeat.
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(
        rename = "heartbeat_interval_ms",
        default = "default_heartbeat_interval"
    )]
    pub heartbeat_interval: Duration,
    /// Extra headers sent with the opening handshake
    #[builder(default)]
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl InstanceConfig {
    /// Returns `true` when this instance takes part in the heartbeat cycle.
    #[must_use]
    pub fn heartbeat_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::configuration("instance id must not be empty"));
        }
        if self.url.trim().is_empty() {
            return Err(Error::configuration(format!(
                "instance '{}' has no url",
                self.id
            )));
        }
        Url::parse(&self.url)?;

        Ok(())
    }
}

/// Configuration surface for a whole manager.
///
/// Holds a list of instances plus an optional single-instance shorthand whose fields sit at the
/// top level. The shorthand only counts when `url` is present.
///
/// ```
/// use ws_connection_manager::config::Settings;
///
/// let settings: Settings = serde_json::from_str(
///     r#"{ "url": "wss://example.com/feed", "instances": [{ "id": "alt", "url": "wss://alt.example.com" }] }"#,
/// )
/// .unwrap();
///
/// let ids: Vec<_> = settings.into_instances().into_iter().map(|c| c.id).collect();
/// assert_eq!(ids, ["default", "alt"]);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(flatten)]
    pub shorthand: Shorthand,
}

/// Top-level single-instance fields of [`Settings`]. Anything left out falls back to the
/// [`InstanceConfig`] defaults.
#[serde_as]
#[non_exhaustive]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Shorthand {
    pub id: Option<String>,
    pub url: Option<String>,
    pub enabled: Option<bool>,
    pub auto_reconnect: Option<bool>,
    pub reconnect_strategy: Option<ReconnectStrategy>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default, rename = "reconnect_delay_ms")]
    pub reconnect_delay: Option<Duration>,
    pub max_reconnect_attempts: Option<u32>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default, rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Option<Duration>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Settings {
    /// Flattens the shorthand (if any) and the explicit list into the final instance list,
    /// shorthand first.
    #[must_use]
    pub fn into_instances(self) -> Vec<InstanceConfig> {
        let Settings {
            mut instances,
            shorthand,
        } = self;

        if let Some(single) = shorthand.into_instance() {
            instances.insert(0, single);
        }

        instances
    }
}

impl Shorthand {
    fn into_instance(self) -> Option<InstanceConfig> {
        let url = self.url?;

        Some(
            InstanceConfig::builder()
                .id(self.id.unwrap_or_else(|| DEFAULT_INSTANCE_ID.to_owned()))
                .url(url)
                .maybe_enabled(self.enabled)
                .maybe_auto_reconnect(self.auto_reconnect)
                .maybe_reconnect_strategy(self.reconnect_strategy)
                .maybe_reconnect_delay(self.reconnect_delay)
                .maybe_max_reconnect_attempts(self.max_reconnect_attempts)
                .maybe_heartbeat_interval(self.heartbeat_interval)
                .headers(self.headers)
                .build(),
        )
    }
}

const fn enabled_by_default() -> bool {
    true
}

const fn default_reconnect_delay() -> Duration {
    DEFAULT_RECONNECT_DELAY_DURATION
}

const fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

const fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL_DURATION
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the event broadcaster.
//!
//! This module defines all configuration types needed to run an
//! [`EventBroadcaster`](crate::EventBroadcaster). Configuration can be
//! constructed programmatically, deserialized from YAML/JSON, or read from
//! the process environment.
//!
//! # Quick Start
//!
//! ```rust
//! use event_replication::config::BroadcasterConfig;
//!
//! let config = BroadcasterConfig::new("http://events:8080", "http://events:8080");
//! assert_eq!(config.topic, "worklog");
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! BroadcasterConfig
//! ├── broadcast_uri: String        # POST {broadcast_uri}/event/{topic}
//! ├── stream_uri: String           # GET  {stream_uri}/eventstream/{topic}
//! ├── topic: String                # Stream name
//! ├── event_type_prefix: String    # "WorkLog" → WorkLogCreated, ...
//! ├── transport: TransportConfig   # Retry schedule, reconnect pause
//! └── apply: ApplyConfig           # Malformed policy, digest check, rate limit
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! broadcast_uri: "http://events:8080"
//! stream_uri: "http://events:8080"
//! topic: "worklog"
//! event_type_prefix: "WorkLog"
//!
//! transport:
//!   max_retries: 10
//!   initial_delay: "1s"
//!
//! apply:
//!   malformed_envelope: skip
//! ```
//!
//! # Environment
//!
//! | Variable | Required | Default |
//! |----------|----------|---------|
//! | `EVENT_STORE` | yes | |
//! | `EVENT_STREAM` | yes | |
//! | `EVENT_TOPIC` | no | `worklog` |
//! | `EVENT_TYPE_PREFIX` | no | `WorkLog` |
//! | `EVENT_MAX_RETRIES` | no | `10` |
//!
//! Broadcasting is enabled only when both required variables are set.

use crate::apply::MalformedEnvelopePolicy;
use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_EVENT_STORE: &str = "EVENT_STORE";
pub const ENV_EVENT_STREAM: &str = "EVENT_STREAM";
pub const ENV_EVENT_TOPIC: &str = "EVENT_TOPIC";
pub const ENV_EVENT_TYPE_PREFIX: &str = "EVENT_TYPE_PREFIX";
pub const ENV_EVENT_MAX_RETRIES: &str = "EVENT_MAX_RETRIES";

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything [`EventBroadcaster::start()`](crate::EventBroadcaster::start) needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    /// Base URI envelopes are POSTed to.
    pub broadcast_uri: String,

    /// Base URI the event stream is read from.
    pub stream_uri: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    /// Entity kind prefix of `eventType`.
    #[serde(default = "default_event_type_prefix")]
    pub event_type_prefix: String,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub apply: ApplyConfig,
}

fn default_topic() -> String {
    "worklog".to_string()
}

fn default_event_type_prefix() -> String {
    "WorkLog".to_string()
}

impl BroadcasterConfig {
    /// Defaults for everything but the two endpoints.
    pub fn new(broadcast_uri: impl Into<String>, stream_uri: impl Into<String>) -> Self {
        Self {
            broadcast_uri: broadcast_uri.into(),
            stream_uri: stream_uri.into(),
            topic: default_topic(),
            event_type_prefix: default_event_type_prefix(),
            transport: TransportConfig::default(),
            apply: ApplyConfig::default(),
        }
    }

    /// Config for tests: fast retries against one local event store.
    pub fn for_testing(base_uri: &str) -> Self {
        Self {
            transport: TransportConfig::testing(),
            ..Self::new(base_uri, base_uri)
        }
    }

    /// Read from the process environment.
    ///
    /// Returns `Ok(None)` if either endpoint variable is unset, meaning
    /// broadcasting is off and the plain mirror store should be used.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (Some(broadcast_uri), Some(stream_uri)) =
            (non_empty(ENV_EVENT_STORE), non_empty(ENV_EVENT_STREAM))
        else {
            return Ok(None);
        };

        let mut config = Self::new(broadcast_uri, stream_uri);
        if let Some(topic) = non_empty(ENV_EVENT_TOPIC) {
            config.topic = topic;
        }
        if let Some(prefix) = non_empty(ENV_EVENT_TYPE_PREFIX) {
            config.event_type_prefix = prefix;
        }
        if let Some(raw) = non_empty(ENV_EVENT_MAX_RETRIES) {
            config.transport.max_retries = raw.trim().parse().map_err(|_| {
                ReplicationError::Config(format!("{ENV_EVENT_MAX_RETRIES} is not a count: {raw:?}"))
            })?;
        }

        config.validate()?;
        Ok(Some(config))
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        check_uri("broadcast_uri", &self.broadcast_uri)?;
        check_uri("stream_uri", &self.stream_uri)?;
        if self.topic.trim().is_empty() {
            return Err(ReplicationError::Config("topic is empty".into()));
        }
        if self.topic.contains('/') {
            return Err(ReplicationError::Config(format!(
                "topic must be a single path segment: {:?}",
                self.topic
            )));
        }
        if self.event_type_prefix.trim().is_empty() {
            return Err(ReplicationError::Config("event_type_prefix is empty".into()));
        }
        self.transport.validate()?;
        self.apply.validate()
    }
}

fn check_uri(field: &str, uri: &str) -> Result<()> {
    if uri.trim().is_empty() {
        return Err(ReplicationError::Config(format!("{field} is empty")));
    }
    if !(uri.starts_with("http://") || uri.starts_with("https://")) {
        return Err(ReplicationError::Config(format!(
            "{field} must be an http(s) URI: {uri:?}"
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransportConfig: retry schedule for every request
// ═══════════════════════════════════════════════════════════════════════════════

/// Resilient transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay before the first retry (humantime string, e.g. `"1s"`).
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    /// Delay multiplier per retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Pause between stream sessions. Zero reconnects straight away.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: String,
}

fn default_max_retries() -> usize {
    10
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_reconnect_delay() -> String {
    "0s".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl TransportConfig {
    /// Fast schedule for tests.
    pub fn testing() -> Self {
        Self {
            max_retries: 3,
            initial_delay: "10ms".to_string(),
            backoff_factor: 2.0,
            reconnect_delay: "10ms".to_string(),
        }
    }

    /// Parse the initial_delay string to a Duration.
    pub fn initial_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.initial_delay).unwrap_or(Duration::from_secs(1))
    }

    /// Parse the reconnect_delay string to a Duration.
    pub fn reconnect_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.reconnect_delay).unwrap_or(Duration::ZERO)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay_duration(),
            backoff_factor: self.backoff_factor,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ReplicationError::Config(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        for (field, value) in [
            ("initial_delay", &self.initial_delay),
            ("reconnect_delay", &self.reconnect_delay),
        ] {
            humantime::parse_duration(value).map_err(|e| {
                ReplicationError::Config(format!("{field} {value:?} is not a duration: {e}"))
            })?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ApplyConfig: inbound event handling
// ═══════════════════════════════════════════════════════════════════════════════

/// Apply loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    #[serde(default)]
    pub malformed_envelope: MalformedEnvelopePolicy,

    /// Recompute `eventSHA` on receipt and treat a mismatch as malformed.
    #[serde(default = "default_true")]
    pub verify_digest: bool,

    /// Throttle the apply loop.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained events per second when rate limiting.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst size when rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            malformed_envelope: MalformedEnvelopePolicy::default(),
            verify_digest: true,
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ApplyConfig {
    /// Create rate limit configuration from the apply settings.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    fn validate(&self) -> Result<()> {
        if self.rate_limit_enabled && (self.rate_limit_per_sec == 0 || self.rate_limit_burst == 0) {
            return Err(ReplicationError::Config(
                "rate limits must be positive when enabled".into(),
            ));
        }
        Ok(())
    }
}

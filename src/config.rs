//! Coordinator configuration.

use crate::errors::{CoordResult, CoordinationError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding [`CoordinatorConfig::pull_timeout_ms`].
pub const ENV_PULL_TIMEOUT_MS: &str = "ADHESIVE_FIELD_PULL_TIMEOUT_MS";
/// Environment variable overriding [`CoordinatorConfig::event_capacity`].
pub const ENV_EVENT_CAPACITY: &str = "ADHESIVE_FIELD_EVENT_CAPACITY";
/// Environment variable overriding [`CoordinatorConfig::session_history`].
pub const ENV_SESSION_HISTORY: &str = "ADHESIVE_FIELD_SESSION_HISTORY";

/// Tunables for a [`Coordinator`](crate::coordinator::Coordinator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Upper bound on how long a transfer request waits for the source.
    pub pull_timeout_ms: u64,

    /// Broadcast channel capacity for lifecycle events.
    pub event_capacity: usize,

    /// How many recent events to keep for inspection.
    pub recent_events: usize,

    /// How many transition log entries the registry keeps.
    pub transition_history: usize,

    /// Max entries kept per VELCRO session context and per GLUE result history.
    pub session_history: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pull_timeout_ms: 5_000,
            event_capacity: 256,
            recent_events: 100,
            transition_history: 1_000,
            session_history: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transfer wait bound
    pub fn pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the recent-events buffer size
    pub fn recent_events(mut self, count: usize) -> Self {
        self.recent_events = count;
        self
    }

    /// Set the transition history size
    pub fn transition_history(mut self, count: usize) -> Self {
        self.transition_history = count;
        self
    }

    /// Set the per-context history cap
    pub fn session_history(mut self, count: usize) -> Self {
        self.session_history = count;
        self
    }

    pub fn pull_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    /// Parse from JSON, then validate.
    pub fn from_json(json: &str) -> CoordResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides. Invalid values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_number::<u64>(ENV_PULL_TIMEOUT_MS) {
            tracing::info!("Environment override: {}={}", ENV_PULL_TIMEOUT_MS, v);
            self.pull_timeout_ms = v;
        }
        if let Some(v) = env_number::<usize>(ENV_EVENT_CAPACITY) {
            tracing::info!("Environment override: {}={}", ENV_EVENT_CAPACITY, v);
            self.event_capacity = v;
        }
        if let Some(v) = env_number::<usize>(ENV_SESSION_HISTORY) {
            tracing::info!("Environment override: {}={}", ENV_SESSION_HISTORY, v);
            self.session_history = v;
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> CoordResult<()> {
        if self.pull_timeout_ms == 0 {
            return Err(CoordinationError::invalid_input("pull_timeout_ms must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(CoordinationError::invalid_input("event_capacity must be > 0"));
        }
        if self.session_history == 0 {
            return Err(CoordinationError::invalid_input("session_history must be > 0"));
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(
                "Invalid value for {}: '{}'. Expected a number. Ignoring.",
                key,
                raw
            );
            None
        }
    }
}

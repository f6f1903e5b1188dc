//! Store tuning knobs.
//!
//! Defaults suit a desktop client; every value can be overridden from
//! `CHAMBER_*` environment variables at startup.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved output headroom used when a model declares no output limit
pub const DEFAULT_OUTPUT_RESERVATION: u64 = 32_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum messages held in memory per session
    pub window_size: usize,
    /// Messages fetched per pagination request
    pub page_size: usize,
    /// Messages on each side of the anchor that trimming must keep
    pub viewport_padding: usize,
    /// Fully materialized sessions allowed before LRU eviction kicks in
    pub max_materialized_sessions: usize,
    /// Quiet period after the last part before a stream enters cooldown
    pub stream_quiescence_ms: u64,
    /// Quiet period after which a stream is considered completed
    pub stream_completion_timeout_ms: u64,
    /// Busy -> idle hand-off delay for backend session status
    pub activity_cooldown_ms: u64,
    /// Period of the lifecycle timer
    pub tick_ms: u64,
    pub default_output_reservation: u64,
    /// Agent assumed for sessions without an explicit agent selection
    pub default_agent: String,
    /// Run LRU eviction after every successful initial load
    pub auto_evict: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            window_size: 90,
            page_size: 30,
            viewport_padding: 10,
            max_materialized_sessions: 5,
            stream_quiescence_ms: 2_000,
            stream_completion_timeout_ms: 30_000,
            activity_cooldown_ms: 2_000,
            tick_ms: 250,
            default_output_reservation: DEFAULT_OUTPUT_RESERVATION,
            default_agent: "build".to_string(),
            auto_evict: true,
        }
    }
}

impl StoreConfig {
    /// Defaults overlaid with `CHAMBER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`, then validated
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        override_with(&lookup, "CHAMBER_WINDOW_SIZE", &mut config.window_size)?;
        override_with(&lookup, "CHAMBER_PAGE_SIZE", &mut config.page_size)?;
        override_with(&lookup, "CHAMBER_VIEWPORT_PADDING", &mut config.viewport_padding)?;
        override_with(
            &lookup,
            "CHAMBER_MAX_MATERIALIZED_SESSIONS",
            &mut config.max_materialized_sessions,
        )?;
        override_with(&lookup, "CHAMBER_STREAM_QUIESCENCE_MS", &mut config.stream_quiescence_ms)?;
        override_with(
            &lookup,
            "CHAMBER_STREAM_COMPLETION_TIMEOUT_MS",
            &mut config.stream_completion_timeout_ms,
        )?;
        override_with(&lookup, "CHAMBER_ACTIVITY_COOLDOWN_MS", &mut config.activity_cooldown_ms)?;
        override_with(&lookup, "CHAMBER_TICK_MS", &mut config.tick_ms)?;
        override_with(&lookup, "CHAMBER_AUTO_EVICT", &mut config.auto_evict)?;
        if let Some(agent) = lookup("CHAMBER_DEFAULT_AGENT").filter(|a| !a.trim().is_empty()) {
            config.default_agent = agent.trim().to_string();
        }

        config.validate()
    }

    /// Reject combinations the window policy cannot honor
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.window_size == 0 || self.page_size == 0 {
            return Err(ConfigError::Inconsistent(
                "window_size and page_size must be positive".into(),
            ));
        }
        // The protected viewport range must fit inside the window, otherwise
        // trimming could never reach the window bound.
        if self.viewport_padding * 2 + 1 > self.window_size {
            return Err(ConfigError::Inconsistent(format!(
                "viewport padding {} does not fit in a window of {}",
                self.viewport_padding, self.window_size
            )));
        }
        if self.max_materialized_sessions == 0 {
            return Err(ConfigError::Inconsistent(
                "max_materialized_sessions must be at least 1".into(),
            ));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::Inconsistent("tick_ms must be positive".into()));
        }
        if self.stream_completion_timeout_ms < self.stream_quiescence_ms {
            return Err(ConfigError::Inconsistent(
                "stream completion timeout is shorter than the quiescence timeout".into(),
            ));
        }
        Ok(self)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

fn override_with<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.clone(),
    })?;
    Ok(())
}

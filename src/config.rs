//! Configuration for event ports.
//!
//! This module provides:
//! - [`PortConfig`] with sensible defaults
//! - Validation of its invariants
//! - Environment overrides (`EVENTPORT_*`)
//!
//! # Example
//!
//! ```
//! use eventport::PortConfig;
//! use std::time::Duration;
//!
//! let config = PortConfig::default()
//!     .with_max_events(128)
//!     .with_default_timeout(Some(Duration::from_millis(250)));
//! assert!(config.validate().is_ok());
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

/// Default batch size for [`EventPort::get_many`](crate::EventPort::get_many) based drains.
pub const DEFAULT_MAX_EVENTS: usize = 64;

/// Upper bound on the batch size (`port_getn` takes a `uint_t` count).
pub const MAX_MAX_EVENTS: usize = 1 << 20;

const ENV_PREFIX: &str = "EVENTPORT_";

/// Tunables for an [`EventPort`](crate::EventPort).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Batch size used when draining.
    pub max_events: usize,
    /// Timeout for [`EventPort::get_next`](crate::EventPort::get_next).
    /// `None` blocks.
    pub default_timeout: Option<Duration>,
    /// Reclaim dissociated cookie entries after a drain finds the queue empty.
    pub reclaim_on_drain: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            default_timeout: None,
            reclaim_on_drain: true,
        }
    }
}

impl PortConfig {
    /// Sets the drain batch size.
    #[must_use]
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Sets the default retrieval timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Enables or disables reclamation on drain.
    #[must_use]
    pub fn with_reclaim_on_drain(mut self, reclaim: bool) -> Self {
        self.reclaim_on_drain = reclaim;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMaxEvents` if the batch size is zero or too large.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_events == 0 || self.max_events > MAX_MAX_EVENTS {
            return Err(ConfigError::InvalidMaxEvents(self.max_events));
        }
        Ok(())
    }

    /// Loads the defaults with `EVENTPORT_*` environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown keys, unparsable values or an invalid
    /// result.
    pub fn from_env() -> Result<Self, ConfigError> {
        let overrides: BTreeMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        let mut config = Self::default();
        config.apply_overrides(&overrides)?;
        Ok(config)
    }

    /// Applies `EVENTPORT_*` style overrides and re-validates.
    ///
    /// On error the configuration is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown keys, unparsable values or an invalid
    /// result.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        let mut next = self.clone();
        for (key, value) in overrides {
            next.apply_override(key, value)?;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn apply_override(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "EVENTPORT_MAX_EVENTS" => {
                self.max_events = value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Parse(format!("{key}: expected integer, got {value:?}")))?;
            }
            "EVENTPORT_DEFAULT_TIMEOUT_MS" => {
                self.default_timeout = parse_timeout_ms(key, value)?;
            }
            "EVENTPORT_RECLAIM_ON_DRAIN" => {
                self.reclaim_on_drain = parse_bool(key, value)?;
            }
            _ => return Err(ConfigError::InvalidOverride(key.to_string())),
        }
        Ok(())
    }
}

fn parse_timeout_ms(key: &str, value: &str) -> Result<Option<Duration>, ConfigError> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("none") || value.eq_ignore_ascii_case("infinite") {
        return Ok(None);
    }
    value
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| ConfigError::Parse(format!("{key}: expected milliseconds or none, got {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Parse(format!("{key}: expected boolean, got {value:?}"))),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A value could not be parsed.
    #[error("config parse error: {0}")]
    Parse(String),
    /// The batch size is out of range.
    #[error("max_events out of range: {0}")]
    InvalidMaxEvents(usize),
    /// An unknown override key was supplied.
    #[error("invalid override: {0}")]
    InvalidOverride(String),
}

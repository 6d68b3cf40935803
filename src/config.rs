//! Match configuration.
//!
//! Loaded from TOML; every field has a default so a partial file is valid.
//!
//! ```toml
//! max_turns = 1000
//! auto_begin = true
//! event_capacity = 128
//!
//! [deadlines]
//! think = 100
//! validate = 1000
//! accept = 1000
//! post = 1000
//! init = 1000
//! match = 10000
//! ```

use derive_getters::Getters;
use derive_more::{Display, Error};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, instrument};

/// Environment variable overriding [`MatchConfig::max_turns`].
pub const ENV_MAX_TURNS: &str = "ARENA_MAX_TURNS";
/// Environment variable overriding [`MatchConfig::auto_begin`].
pub const ENV_AUTO_BEGIN: &str = "ARENA_AUTO_BEGIN";
/// Environment variable overriding the think deadline (milliseconds).
pub const ENV_THINK_MS: &str = "ARENA_THINK_MS";

/// Largest accepted [`MatchConfig::event_capacity`].
pub const MAX_EVENT_CAPACITY: usize = 65_536;

/// Per-match settings shared by every game a registry creates.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Setters, Serialize, Deserialize)]
#[setters(prefix = "with_")]
#[serde(default)]
pub struct MatchConfig {
    /// Turn ceiling; entering a turn past it is a configuration error.
    max_turns: u32,

    /// Start the turn loop as soon as the game becomes ready.
    auto_begin: bool,

    /// Buffer size of the match event channel.
    event_capacity: usize,

    /// Step deadlines in milliseconds.
    deadlines: DeadlineConfig,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_turns: 1000,
            auto_begin: true,
            event_capacity: 128,
            deadlines: DeadlineConfig::default(),
        }
    }
}

/// Step deadlines in milliseconds. Zero disables the deadline for that step.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Setters, Serialize, Deserialize)]
#[setters(prefix = "with_")]
#[serde(default)]
pub struct DeadlineConfig {
    /// Participant producing a move.
    think: u64,
    /// Rule validating a move.
    validate: u64,
    /// Rule accepting a move into the match state.
    accept: u64,
    /// Rule post-move check.
    post: u64,
    /// Rule initialization.
    init: u64,
    /// Umbrella deadline over the whole run.
    #[serde(rename = "match")]
    whole_match: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            think: 100,
            validate: 1000,
            accept: 1000,
            post: 1000,
            init: 1000,
            whole_match: 10_000,
        }
    }
}

impl DeadlineConfig {
    /// A configuration with every deadline disabled.
    pub fn unbounded() -> Self {
        Self {
            think: 0,
            validate: 0,
            accept: 0,
            post: 0,
            init: 0,
            whole_match: 0,
        }
    }
}

impl MatchConfig {
    /// Loads configuration from a TOML file.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        debug!("Loading match config from file");
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("Failed to read config file: {}", e)))?;

        let config = Self::from_toml(&content)?;
        info!(max_turns = config.max_turns, auto_begin = config.auto_begin, "Config loaded successfully");
        Ok(config)
    }

    /// Parses configuration from TOML text.
    #[instrument(skip(content))]
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::new(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `ARENA_*` environment overrides.
    #[instrument(skip(self))]
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    #[instrument(skip(self, lookup))]
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(ENV_MAX_TURNS) {
            self.max_turns = raw.trim().parse().map_err(|e| {
                ConfigError::new(format!("{} must be an integer, got {:?}: {}", ENV_MAX_TURNS, raw, e))
            })?;
            debug!(max_turns = self.max_turns, "Overrode max_turns");
        }

        if let Some(raw) = lookup(ENV_AUTO_BEGIN) {
            self.auto_begin = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::new(format!(
                        "{} must be a boolean, got {:?}",
                        ENV_AUTO_BEGIN, other
                    )));
                }
            };
            debug!(auto_begin = self.auto_begin, "Overrode auto_begin");
        }

        if let Some(raw) = lookup(ENV_THINK_MS) {
            self.deadlines.think = raw.trim().parse().map_err(|e| {
                ConfigError::new(format!("{} must be an integer, got {:?}: {}", ENV_THINK_MS, raw, e))
            })?;
            debug!(think_ms = self.deadlines.think, "Overrode think deadline");
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks values the engine cannot work with.
    #[instrument(skip(self))]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::new("event_capacity must be at least 1".to_string()));
        }
        if self.event_capacity > MAX_EVENT_CAPACITY {
            return Err(ConfigError::new(format!(
                "event_capacity must be at most {}, got {}",
                MAX_EVENT_CAPACITY, self.event_capacity
            )));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Display, Error)]
#[display("Config error: {} at {}:{}", message, file, line)]
pub struct ConfigError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}

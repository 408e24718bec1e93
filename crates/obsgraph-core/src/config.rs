#![forbid(unsafe_code)]

//! Policy configuration and environment parsing.
//!
//! Environment variables:
//! - `OBSGRAPH_UPDATES` = enabled|disabled|deferred
//! - `OBSGRAPH_CATCH_PANICS` (bool)
//!
//! Unparseable values are reported as [`ConfigError`] diagnostics and the
//! default for that field is kept.

use std::env;
use std::fmt;

use crate::policy::UpdateMode;

pub const ENV_UPDATES: &str = "OBSGRAPH_UPDATES";
pub const ENV_CATCH_PANICS: &str = "OBSGRAPH_CATCH_PANICS";

/// Construction-time settings for a [`NotificationPolicy`](crate::NotificationPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Mode the policy starts in.
    pub initial_mode: UpdateMode,
    /// Convert panics inside reactions into [`ReactionError`](crate::ReactionError)s
    /// instead of unwinding through the fan-out.
    pub catch_panics: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            initial_mode: UpdateMode::Enabled,
            catch_panics: true,
        }
    }
}

impl PolicyConfig {
    /// Set the starting mode.
    #[must_use]
    pub fn with_initial_mode(mut self, mode: UpdateMode) -> Self {
        self.initial_mode = mode;
        self
    }

    /// Set panic capture for reactions.
    #[must_use]
    pub fn with_catch_panics(mut self, enabled: bool) -> Self {
        self.catch_panics = enabled;
        self
    }

    /// Parse config from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with_diagnostics().config
    }

    /// Parse config from environment variables and return diagnostics.
    #[must_use]
    pub fn from_env_with_diagnostics() -> PolicyConfigParse {
        Self::from_env_with(|key| env::var(key).ok())
    }

    /// Parse config through an arbitrary variable lookup.
    pub fn from_env_with<F>(mut get: F) -> PolicyConfigParse
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let mut errors = Vec::new();

        if let Some(value) = get(ENV_UPDATES) {
            match UpdateMode::parse(&value) {
                Some(mode) => config.initial_mode = mode,
                None => errors.push(ConfigError::new(
                    "initial_mode",
                    value,
                    "expected enabled|disabled|deferred",
                )),
            }
        }

        if let Some(value) = get(ENV_CATCH_PANICS) {
            match parse_bool(&value) {
                Some(flag) => config.catch_panics = flag,
                None => errors.push(ConfigError::new(
                    "catch_panics",
                    value,
                    "expected bool (1/0/true/false)",
                )),
            }
        }

        PolicyConfigParse { config, errors }
    }
}

/// Parsed config plus any rejected values.
#[derive(Debug, Clone)]
pub struct PolicyConfigParse {
    pub config: PolicyConfig,
    pub errors: Vec<ConfigError>,
}

/// A rejected configuration value with field context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub field: &'static str,
    pub value: String,
    pub message: String,
}

impl ConfigError {
    fn new(field: &'static str, value: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} ({})", self.field, self.value, self.message)
    }
}

impl std::error::Error for ConfigError {}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

//! Persistence configuration surface.
//!
//! # Responsibility
//! - Hold the settings the persistence core consumes: sequence strategy,
//!   default block size, optimistic retry budget and store timeouts.
//!
//! # Invariants
//! - A validated config never carries a zero increment or zero retry budget.
//! - Loading configuration files is the caller's job; this module only
//!   parses and validates an already-loaded document.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const DEFAULT_INCREMENT: u64 = 500;
pub const DEFAULT_MIN_VALUE: u64 = 1;
pub const DEFAULT_CONFLICT_RETRIES: u32 = 8;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// How sequence counters advance in the backing store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStrategy {
    /// One atomic increment statement per block.
    #[default]
    #[serde(alias = "seq")]
    Native,
    /// Read, compute, then compare-and-swap the counter row.
    Table,
}

impl SequenceStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Table => "table",
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "invalid persistence config: {err}"),
            Self::Invalid(message) => write!(f, "invalid persistence config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

/// Settings consumed by the allocator and the SQLite backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub sequence_strategy: SequenceStrategy,
    /// Block size used when a sequence is registered with increment `0`.
    pub default_increment: u64,
    pub default_min_value: u64,
    /// Attempts the table strategy makes before reporting a conflict.
    pub conflict_retries: u32,
    pub busy_timeout_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            sequence_strategy: SequenceStrategy::default(),
            default_increment: DEFAULT_INCREMENT,
            default_min_value: DEFAULT_MIN_VALUE,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl PersistConfig {
    /// Parses and validates a JSON document; absent keys take defaults.
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(source).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_increment == 0 {
            return Err(ConfigError::Invalid(
                "default_increment must be greater than zero".to_string(),
            ));
        }
        if self.conflict_retries == 0 {
            return Err(ConfigError::Invalid(
                "conflict_retries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, PersistConfig, SequenceStrategy};

    #[test]
    fn empty_document_uses_defaults() {
        let config = PersistConfig::from_json_str("{}").expect("defaults should validate");
        assert_eq!(config, PersistConfig::default());
        assert_eq!(config.default_increment, 500);
    }

    #[test]
    fn legacy_seq_alias_selects_native_strategy() {
        let config = PersistConfig::from_json_str(r#"{"sequence_strategy":"seq"}"#)
            .expect("alias should parse");
        assert_eq!(config.sequence_strategy, SequenceStrategy::Native);

        let config = PersistConfig::from_json_str(r#"{"sequence_strategy":"table"}"#)
            .expect("table should parse");
        assert_eq!(config.sequence_strategy, SequenceStrategy::Table);
    }

    #[test]
    fn zero_increment_is_rejected() {
        let err = PersistConfig::from_json_str(r#"{"default_increment":0}"#)
            .expect_err("zero increment must fail");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_strategy_is_a_parse_error() {
        let err = PersistConfig::from_json_str(r#"{"sequence_strategy":"raft"}"#)
            .expect_err("unknown strategy must fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

//! Session configuration.
//!
//! Defaults match the backend's documented limits; every knob can be
//! overridden through `HOLO_SESSION_*` environment variables.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

/// Default idle interval after which the worker issues a keep-alive query.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);
/// Default statement used to keep an idle read/write transaction alive.
const DEFAULT_KEEP_ALIVE_SQL: &str = "SELECT 1";
/// Default poll interval used while a caller blocks on the worker.
const DEFAULT_WAIT_POLL: Duration = Duration::from_millis(50);
/// Documented per-commit mutation ceiling of the backend.
pub const DEFAULT_MAX_MUTATIONS_PER_COMMIT: usize = 20_000;
/// Byte budget used when estimating rows per commit.
pub const DEFAULT_BATCH_BYTE_BUDGET: usize = 100 * 1024 * 1024;
/// Smallest batch size the estimator hands out when the ceiling allows it.
pub const DEFAULT_MIN_BATCH_SIZE: usize = 100;
/// Length assumed for columns declared without a maximum length.
pub const DEFAULT_UNBOUNDED_COLUMN_LENGTH: usize = 1024;

/// Runtime configuration shared by connections, sessions and workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Idle time after which the transaction worker sends `keep_alive_sql`.
    pub keep_alive_interval: Duration,
    /// Statement issued to keep an idle read/write transaction open.
    pub keep_alive_sql: String,
    /// How often blocked callers check their interrupt flag.
    pub wait_poll_interval: Duration,
    /// Hard per-commit mutation ceiling.
    pub max_mutations_per_commit: usize,
    /// Byte budget used by the batch size estimator.
    pub batch_byte_budget: usize,
    /// Floor applied by the batch size estimator.
    pub min_batch_size: usize,
    /// Declared length assumed for unbounded STRING/BYTES columns.
    pub unbounded_column_length: usize,
    /// Initial value of the connection's allow-extended-mode flag.
    pub allow_extended_mode: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE,
            keep_alive_sql: DEFAULT_KEEP_ALIVE_SQL.to_string(),
            wait_poll_interval: DEFAULT_WAIT_POLL,
            max_mutations_per_commit: DEFAULT_MAX_MUTATIONS_PER_COMMIT,
            batch_byte_budget: DEFAULT_BATCH_BYTE_BUDGET,
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            unbounded_column_length: DEFAULT_UNBOUNDED_COLUMN_LENGTH,
            allow_extended_mode: false,
        }
    }
}

impl SessionConfig {
    /// Builds configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let keep_alive_ms = parse_u64(
            std::env::var("HOLO_SESSION_KEEP_ALIVE_MS").ok(),
            defaults.keep_alive_interval.as_millis() as u64,
        )?
        .max(1);
        let keep_alive_sql = std::env::var("HOLO_SESSION_KEEP_ALIVE_SQL")
            .ok()
            .filter(|sql| !sql.trim().is_empty())
            .unwrap_or(defaults.keep_alive_sql);
        let wait_poll_ms = parse_u64(
            std::env::var("HOLO_SESSION_WAIT_POLL_MS").ok(),
            defaults.wait_poll_interval.as_millis() as u64,
        )?
        .max(1);
        let max_mutations_per_commit = parse_usize(
            std::env::var("HOLO_SESSION_MAX_MUTATIONS_PER_COMMIT").ok(),
            defaults.max_mutations_per_commit,
        )?;
        let batch_byte_budget = parse_usize(
            std::env::var("HOLO_SESSION_BATCH_BYTE_BUDGET").ok(),
            defaults.batch_byte_budget,
        )?;
        let min_batch_size = parse_usize(
            std::env::var("HOLO_SESSION_MIN_BATCH_SIZE").ok(),
            defaults.min_batch_size,
        )?
        .max(1);
        let unbounded_column_length = parse_usize(
            std::env::var("HOLO_SESSION_UNBOUNDED_COLUMN_LENGTH").ok(),
            defaults.unbounded_column_length,
        )?
        .max(1);
        let allow_extended_mode = parse_bool(
            std::env::var("HOLO_SESSION_ALLOW_EXTENDED_MODE").ok(),
            defaults.allow_extended_mode,
        )?;

        let config = Self {
            keep_alive_interval: Duration::from_millis(keep_alive_ms),
            keep_alive_sql,
            wait_poll_interval: Duration::from_millis(wait_poll_ms),
            max_mutations_per_commit,
            batch_byte_budget,
            min_batch_size,
            unbounded_column_length,
            allow_extended_mode,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects limits the estimator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_mutations_per_commit == 0 {
            return Err(anyhow!("max_mutations_per_commit must be positive"));
        }
        if self.batch_byte_budget == 0 {
            return Err(anyhow!("batch_byte_budget must be positive"));
        }
        Ok(())
    }
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional boolean, accepting common truthy and falsy spellings.
fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    let Some(raw) = value else {
        return Ok(default_value);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(anyhow!("invalid bool value: {raw}")),
    }
}

//! Bridge configuration

use std::env;
use thiserror::Error;

/// Default capacity of a cursor's document buffer (64 KiB).
pub const DEFAULT_CURSOR_BUFFER_CAPACITY: usize = 64 * 1024;

/// Upper bound accepted for the document buffer (16 MiB).
pub const MAX_CURSOR_BUFFER_CAPACITY: usize = 16 * 1024 * 1024;

const ENV_CURSOR_BUFFER_BYTES: &str = "FORMBD_CURSOR_BUFFER_BYTES";
const ENV_VALIDATE_PROVENANCE: &str = "FORMBD_VALIDATE_PROVENANCE";
const ENV_BLOCKING_THREADS: &str = "FORMBD_BLOCKING_THREADS";

/// Errors raised while building a [`BridgeConfig`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cursor buffer capacity {0} is outside 1..={max}", max = MAX_CURSOR_BUFFER_CAPACITY)]
    CursorBufferCapacity(usize),

    #[error("blocking thread count must be at least 1")]
    BlockingThreads,

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("failed to start blocking executor: {0}")]
    Executor(String),
}

/// Configuration for a [`Bridge`](crate::Bridge) and its blocking executor
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bytes reserved per cursor for one result document. Larger documents
    /// fail with a corruption-class error rather than being truncated.
    pub cursor_buffer_capacity: usize,
    /// Reject provenance metadata that is not well-formed JSON before calling
    /// the engine.
    pub validate_provenance: bool,
    /// Threads reserved for potentially blocking native calls.
    pub blocking_threads: usize,
    /// Name given to those threads.
    pub thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cursor_buffer_capacity: DEFAULT_CURSOR_BUFFER_CAPACITY,
            validate_provenance: true,
            blocking_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            thread_name: "formbd-blocking".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `FORMBD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_CURSOR_BUFFER_BYTES) {
            config.cursor_buffer_capacity = parse(ENV_CURSOR_BUFFER_BYTES, value)?;
        }
        if let Some(value) = lookup(ENV_VALIDATE_PROVENANCE) {
            config.validate_provenance = match value.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_VALIDATE_PROVENANCE,
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup(ENV_BLOCKING_THREADS) {
            config.blocking_threads = parse(ENV_BLOCKING_THREADS, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_cursor_buffer_capacity(mut self, capacity: usize) -> Self {
        self.cursor_buffer_capacity = capacity;
        self
    }

    pub fn with_validate_provenance(mut self, validate: bool) -> Self {
        self.validate_provenance = validate;
        self
    }

    pub fn with_blocking_threads(mut self, threads: usize) -> Self {
        self.blocking_threads = threads;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Check the configured values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CURSOR_BUFFER_CAPACITY).contains(&self.cursor_buffer_capacity) {
            return Err(ConfigError::CursorBufferCapacity(
                self.cursor_buffer_capacity,
            ));
        }
        if self.blocking_threads == 0 {
            return Err(ConfigError::BlockingThreads);
        }
        Ok(())
    }
}

fn parse(var: &'static str, value: String) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

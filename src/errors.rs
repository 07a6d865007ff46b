//! Error taxonomy and retry policies for the scanner
//!
//! Errors are classified the way the process reacts to them: config errors
//! abort startup, transient errors are retried with backoff, permanent
//! external errors mark the affected token and move on, logic faults are
//! logged and skipped.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for scanner operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration validation failure, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient storage failure (busy, locked, constraint race)
    #[error("transient storage error: {0}")]
    StorageTransient(String),

    /// Storage failure that cannot be retried
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Transient external failure (429/5xx, stream disconnect)
    #[error("transient external error: {0}")]
    ExternalTransient(String),

    /// Permanent external failure (400/404 on metadata)
    #[error("permanent external error: {0}")]
    ExternalPermanent(String),

    /// Stream disconnected unexpectedly
    #[error("stream disconnected")]
    StreamDisconnected,

    /// Decode failure on stream payloads
    #[error("decode error: {0}")]
    Decode(String),

    /// Impossible transition, unknown category, missing handler
    #[error("logic fault: {0}")]
    Logic(String),

    /// Shutdown requested while an operation was in flight
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Wrapped error from external crates
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether retrying the operation might succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StorageTransient(_) | Self::ExternalTransient(_) | Self::StreamDisconnected => {
                true
            }
            Self::Config(_)
            | Self::Storage(_)
            | Self::ExternalPermanent(_)
            | Self::Decode(_)
            | Self::Logic(_)
            | Self::ShutdownRequested
            | Self::Other(_) => false,
        }
    }

    /// Error class for metrics and the 5-minute error windows
    pub fn class(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::StorageTransient(_) | Self::Storage(_) => "storage",
            Self::ExternalTransient(_) | Self::StreamDisconnected => "external_transient",
            Self::ExternalPermanent(_) => "external_permanent",
            Self::Decode(_) => "decode",
            Self::Logic(_) => "logic",
            Self::ShutdownRequested => "shutdown",
            Self::Other(_) => "other",
        }
    }
}

/// Classify a rusqlite error as transient or terminal
///
/// Busy/locked conditions and unique-constraint races retry once at the
/// call site; everything else is terminal for the current batch.
pub fn classify_sqlite(err: rusqlite::Error) -> EngineError {
    use rusqlite::ErrorCode;
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation
            ) =>
        {
            EngineError::StorageTransient(err.to_string())
        }
        _ => EngineError::Storage(err),
    }
}

/// Exponential backoff with ±20% jitter for external retries
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current_attempt: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl ExponentialBackoff {
    pub fn new(initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            current_attempt: 0,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Next delay, doubling per attempt up to the cap, with jitter
    pub fn next_backoff(&mut self) -> Duration {
        let backoff_ms = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(self.current_attempt))
            .min(self.max_backoff_ms);
        self.current_attempt += 1;

        let jitter = (backoff_ms / 5).max(1);
        let offset = fastrand::i64(-(jitter as i64)..=jitter as i64);
        let final_ms = (backoff_ms as i64 + offset).max(0) as u64;
        Duration::from_millis(final_ms)
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }
}

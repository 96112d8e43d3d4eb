//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `AcqError`, used throughout
//! the crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of a multi-stream acquisition:
//!
//! - **`Cancelled`**: a cancellation request won the race against an
//!   in-progress or about-to-start stream acquisition. Always a distinct,
//!   non-partial outcome (no results are returned with it).
//! - **`StreamFailed`**: a stream's own acquisition handle reported an error.
//!   Fatal only when it happens on the very first stream; afterwards the
//!   collected results are returned alongside the error.
//! - **`FocusMoveFailed`**: the focuser move between Z levels failed. Treated
//!   exactly like a stream failure at the same point of the run.
//! - **`WatchdogExpired`**: the optional acquisition watchdog fired while
//!   waiting on a stream (only when configured; the default is to wait
//!   indefinitely).
//! - **`InvalidZLevels`**: the Z-level map referenced a stream that is not
//!   part of the acquisition, or listed no levels for a stream.
//! - **`Config`** / **`Configuration`**: configuration file/environment
//!   parsing errors (wrapped from `figment`) and semantic validation errors.
//!
//! Job-handle misuse (`ResultAlreadyTaken`, `ResultTimeout`, `TaskAborted`)
//! is reported through the same type so callers handle one error enum.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Errors produced by the acquisition core.
#[derive(Error, Debug)]
pub enum AcqError {
    #[error("acquisition cancelled")]
    Cancelled,

    #[error("stream '{stream}' failed: {source}")]
    StreamFailed {
        /// Name of the stream whose acquisition failed.
        stream: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("focus move to {position_m} m failed for stream '{stream}': {source}")]
    FocusMoveFailed {
        /// Name of the stream whose focuser was being moved.
        stream: String,
        /// Target absolute Z position in metres.
        position_m: f64,
        #[source]
        source: anyhow::Error,
    },

    #[error("stream '{stream}' exceeded the acquisition watchdog of {timeout:?}")]
    WatchdogExpired {
        /// Name of the stream that hung.
        stream: String,
        /// Configured watchdog duration.
        timeout: Duration,
    },

    #[error("invalid Z-level map: {0}")]
    InvalidZLevels(String),

    #[error("acquisition result not ready within {0:?}")]
    ResultTimeout(Duration),

    #[error("acquisition job result already taken")]
    ResultAlreadyTaken,

    #[error("acquisition task aborted: {0}")]
    TaskAborted(String),

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("configuration validation error: {0}")]
    Configuration(String),
}

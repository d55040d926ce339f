//! Error Types
//!
//! This module defines the error types used throughout the crate.
//!
//! Most configuration failures are deliberately *not* surfaced as errors:
//! a page that cannot be read, decrypted or executed is logged and skipped,
//! and loading continues (the page simply contributes no declarations).
//! [`SagaError`] covers the cases where an operation has a caller that can
//! meaningfully react to the failure.

use thiserror::Error;

/// The main error type for the saga core.
#[derive(Error, Debug)]
pub enum SagaError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// File I/O error while reading a config page.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// An encrypted page could not be decrypted (missing or wrong key,
    /// or the payload is truncated).
    #[error("Decrypt error: {0}")]
    DecryptError(String),

    /// An executable page exited with a nonzero status.
    #[error("Subprocess {command:?} exited with status {status}")]
    SubprocessError {
        /// The command that was spawned
        command: String,
        /// The exit status reported by the OS
        status: i32,
    },

    /// A glob pattern in one of the pattern lists did not parse.
    #[error("Invalid glob pattern: {0}")]
    GlobError(#[from] globset::Error),

    // ========================================================================
    // Wire Format Errors
    // ========================================================================
    /// A datagram ended before the expected field.
    #[error("Datagram underflow at offset {0}")]
    DatagramUnderflow(usize),

    /// A datagram referenced an attribute kind that has no registered
    /// read factory.
    #[error("Unknown attribute kind in datagram: {0}")]
    UnknownAttribKind(String),

    /// A datagram carried an attribute id or slot outside the valid range.
    #[error("Malformed datagram: {0}")]
    MalformedDatagram(String),

    /// A string field was not valid UTF-8.
    #[error("Invalid UTF-8 in datagram")]
    InvalidUtf8,
}

impl From<std::string::FromUtf8Error> for SagaError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        SagaError::InvalidUtf8
    }
}

/// Alias for `Result<T, SagaError>`.
pub type Result<T> = std::result::Result<T, SagaError>;

//! Error types for Turnstile.
//!
//! A rejected acquisition is not an error; it is reported as
//! [`Outcome::Rejected`](crate::ratelimit::Outcome). The variants here cover
//! bad configuration, which is fatal at startup, and caller bugs.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid policy parameter or unreadable policy file
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy with this name is already registered
    #[error("Duplicate policy name: {0}")]
    DuplicatePolicy(String),

    /// No policy with this name is registered
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// The caller broke the limiter protocol (foreign lease, closed limiter,
    /// impossible permit count)
    #[error("Protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error is a configuration problem rather than a caller bug.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TurnstileError::Config(_)
                | TurnstileError::DuplicatePolicy(_)
                | TurnstileError::UnknownPolicy(_)
                | TurnstileError::Io(_)
        )
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

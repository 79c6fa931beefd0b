//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A day key was not a valid `YYYY-MM-DD` calendar date
    #[error("Invalid day key: {value} (expected YYYY-MM-DD)")]
    InvalidDayKey { value: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

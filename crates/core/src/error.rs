//! Membership error model.

use thiserror::Error;

/// Result type used across the membership engine.
pub type MembershipResult<T> = Result<T, MembershipError>;

/// Failure taxonomy exposed to callers of the membership engine.
///
/// Callers translate these into their own protocol (HTTP status, RPC code).
/// Nothing in this crate knows about transports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MembershipError {
    /// Malformed input (bad subject type, empty id, negative timestamp,
    /// out-of-range paging). Always raised before any store call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation requires a subject, group or ledger row that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate key where exclusivity is required.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The underlying store failed; the whole operation was rolled back.
    #[error("store error: {0}")]
    Store(String),
}

impl MembershipError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::ConstraintViolation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Whether resending the same request may succeed.
    ///
    /// Only store failures qualify: validation, not-found and constraint
    /// failures are deterministic for a given ledger state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_failures_are_retryable() {
        assert!(MembershipError::store("deadlock detected").is_retryable());
        assert!(!MembershipError::validation("empty id").is_retryable());
        assert!(!MembershipError::not_found("group").is_retryable());
        assert!(!MembershipError::constraint("duplicate").is_retryable());
    }

    #[test]
    fn messages_carry_context() {
        let err = MembershipError::validation("subject id must not be empty");
        assert_eq!(err.to_string(), "validation failed: subject id must not be empty");
    }
}

//! Structured error types for the broker.
//!
//! `Error` provides pattern-matchable errors instead of generic
//! `anyhow::Error`, each carrying a wire-visible numeric code grouped by
//! thousands: 1xxx validation, 2xxx lifecycle, 3xxx worker, 4xxx routing,
//! 5xxx rate-limit, 6xxx dependencies, 9xxx storage.
//!
//! # The Error Boundary Rule
//!
//! Server-side scripts never raise: they return a discriminated result and
//! the repository translates it into one of these variants. Event-publish
//! failures are logged and swallowed; they must never fail a state
//! transition. `anyhow` stays internal transport for handler bodies.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broker error taxonomy.
///
/// Every variant maps to a stable numeric code via [`Error::code`]; the
/// grouping is part of the external contract and is relied on by the
/// retry-eligibility classification in [`crate::retry`].
#[derive(Debug, Error)]
pub enum Error {
    /// Payload could not be encoded or decoded.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Job configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Job type does not match `^[A-Za-z0-9_-]{{1,100}}$`.
    #[error("invalid job type: {0:?}")]
    InvalidJobType(String),

    /// No job stored under the given id.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// An operation was attempted from a status that does not permit it.
    #[error("invalid job state: expected {expected}, found {actual}")]
    InvalidState {
        /// Status the operation requires.
        expected: &'static str,
        /// Status the job was actually in.
        actual: String,
    },

    /// A worker claimed a job type it has no handler for.
    #[error("no handler registered for job type {0:?}")]
    HandlerMissing(String),

    /// Worker does not satisfy the job's capability target.
    #[error("worker capability mismatch")]
    CapabilityMismatch,

    /// No registered worker can satisfy the job's target.
    #[error("no worker matches the job target")]
    NoMatchingWorker,

    /// Fixed-window rate limit is saturated.
    #[error("rate limit exceeded for bucket {key}")]
    RateLimited {
        /// Bucket key that is saturated.
        key: String,
        /// Milliseconds until the window resets.
        reset_ms: i64,
    },

    /// The job still has unsatisfied dependencies.
    #[error("unsatisfied dependencies: {0:?}")]
    UnsatisfiedDependencies(Vec<String>),

    /// Underlying store command failed.
    #[error("store failure: {0}")]
    Storage(#[from] redis::RedisError),

    /// Could not acquire a pooled connection before the deadline.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// A write reached the store but was rejected.
    #[error("store write failed: {0}")]
    StorageWrite(String),

    /// A read reached the store but returned malformed data.
    #[error("store read failed: {0}")]
    StorageRead(String),

    /// Lifecycle event could not be published.
    ///
    /// Callers on the state-transition path must log-and-swallow this;
    /// it exists for the explicit publisher API only.
    #[error("event publish failed: {0}")]
    EventPublish(String),
}

impl Error {
    /// The wire-visible numeric code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Error::InvalidPayload(_) => 1001,
            Error::InvalidConfig(_) => 1002,
            Error::InvalidJobType(_) => 1003,
            Error::JobNotFound(_) => 2001,
            Error::InvalidState { .. } => 2002,
            Error::HandlerMissing(_) => 3001,
            Error::CapabilityMismatch => 3003,
            Error::NoMatchingWorker => 4001,
            Error::RateLimited { .. } => 5001,
            Error::UnsatisfiedDependencies(_) => 6001,
            Error::Storage(_) | Error::PoolExhausted => 9001,
            Error::StorageWrite(_) => 9004,
            Error::StorageRead(_) => 9005,
            Error::EventPublish(_) => 9006,
        }
    }

    /// Whether a failure with this error may be retried by the queue.
    ///
    /// Validation failures and capability mismatches are permanent; storage
    /// and transient conditions are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.code(),
            crate::retry::CODE_INVALID_PAYLOAD
                | crate::retry::CODE_INVALID_CONFIG
                | crate::retry::CODE_CAPABILITY_MISMATCH
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_group_by_thousands() {
        assert_eq!(Error::InvalidPayload("x".into()).code(), 1001);
        assert_eq!(Error::InvalidConfig("x".into()).code(), 1002);
        assert_eq!(Error::InvalidJobType("!".into()).code(), 1003);
        assert_eq!(Error::JobNotFound("j".into()).code(), 2001);
        assert_eq!(Error::HandlerMissing("t".into()).code(), 3001);
        assert_eq!(Error::CapabilityMismatch.code(), 3003);
        assert_eq!(Error::NoMatchingWorker.code(), 4001);
        assert_eq!(
            Error::RateLimited {
                key: "k".into(),
                reset_ms: 0
            }
            .code(),
            5001
        );
        assert_eq!(Error::UnsatisfiedDependencies(vec![]).code(), 6001);
        assert_eq!(Error::PoolExhausted.code(), 9001);
        assert_eq!(Error::StorageWrite("w".into()).code(), 9004);
        assert_eq!(Error::StorageRead("r".into()).code(), 9005);
        assert_eq!(Error::EventPublish("p".into()).code(), 9006);
    }

    #[test]
    fn test_retryability_follows_code_set() {
        assert!(!Error::InvalidPayload("x".into()).is_retryable());
        assert!(!Error::InvalidConfig("x".into()).is_retryable());
        assert!(!Error::CapabilityMismatch.is_retryable());
        assert!(Error::PoolExhausted.is_retryable());
        assert!(Error::StorageWrite("w".into()).is_retryable());
        assert!(Error::JobNotFound("j".into()).is_retryable());
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = Error::InvalidState {
            expected: "active",
            actual: "pending".to_string(),
        };
        match &err {
            Error::InvalidState { expected, actual } => {
                assert_eq!(*expected, "active");
                assert_eq!(actual, "pending");
            }
            _ => panic!("expected InvalidState"),
        }
        assert!(err.to_string().contains("expected active"));
    }
}

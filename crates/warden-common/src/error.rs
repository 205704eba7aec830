//! Error types and error codes for Warden
//!
//! This module defines:
//! - `LockError`: the lock protocol's error taxonomy
//! - `ErrorCode`: structured error codes for callers that report over an API

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors returned by lock acquisition, release and teardown
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock backend client is not initialized yet")]
    NotInitialized,

    #[error("lock '{0}' is currently held by another client")]
    LockHeld(String),

    #[error("failed to acquire lock '{key}' within {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("acquisition of lock '{0}' cancelled by shutdown")]
    Cancelled(String),

    #[error("failed to commit lock transaction: {0}")]
    TransactionFailed(String),

    #[error("lock store error: {0}")]
    Store(String),

    #[error("lock '{0}' is held by a different owner")]
    NotOwner(String),

    #[error("invalid lock argument: {0}")]
    InvalidArgument(String),
}

impl LockError {
    /// Structured error code for this error
    pub fn error_code(&self) -> ErrorCode<'static> {
        match self {
            LockError::NotInitialized => LOCK_NOT_INITIALIZED,
            LockError::LockHeld(_) => LOCK_HELD,
            LockError::Timeout { .. } => LOCK_TIMEOUT,
            LockError::Cancelled(_) => LOCK_CANCELLED,
            LockError::TransactionFailed(_) => LOCK_TRANSACTION_FAILED,
            LockError::Store(_) => LOCK_STORE_ERROR,
            LockError::NotOwner(_) => LOCK_NOT_OWNER,
            LockError::InvalidArgument(_) => PARAMETER_VALIDATE_ERROR,
        }
    }

    /// Whether the same call may succeed if simply attempted again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::LockHeld(_)
                | LockError::Timeout { .. }
                | LockError::TransactionFailed(_)
                | LockError::Store(_)
        )
    }
}

/// Error code structure for API responses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

pub const PARAMETER_VALIDATE_ERROR: ErrorCode<'static> = ErrorCode {
    code: 20002,
    message: "parameter validate error",
};

// Lock errors
pub const LOCK_NOT_INITIALIZED: ErrorCode<'static> = ErrorCode {
    code: 40000,
    message: "lock backend not initialized",
};

pub const LOCK_HELD: ErrorCode<'static> = ErrorCode {
    code: 40001,
    message: "lock is held by another client",
};

pub const LOCK_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: 40002,
    message: "lock acquisition timed out",
};

pub const LOCK_CANCELLED: ErrorCode<'static> = ErrorCode {
    code: 40003,
    message: "lock acquisition cancelled",
};

pub const LOCK_TRANSACTION_FAILED: ErrorCode<'static> = ErrorCode {
    code: 40004,
    message: "lock transaction failed",
};

pub const LOCK_STORE_ERROR: ErrorCode<'static> = ErrorCode {
    code: 40005,
    message: "lock store error",
};

pub const LOCK_NOT_OWNER: ErrorCode<'static> = ErrorCode {
    code: 40006,
    message: "lock is held by a different owner",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LockError::LockHeld("job-42".to_string());
        assert_eq!(
            err.to_string(),
            "lock 'job-42' is currently held by another client"
        );

        let err = LockError::Timeout {
            key: "job-42".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.to_string(), "failed to acquire lock 'job-42' within 1s");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(LockError::NotInitialized.error_code().code, 40000);
        assert_eq!(
            LockError::NotOwner("k".to_string()).error_code(),
            LOCK_NOT_OWNER
        );
        assert_eq!(
            LockError::InvalidArgument("ttl".to_string()).error_code(),
            PARAMETER_VALIDATE_ERROR
        );
    }

    #[test]
    fn test_retryable() {
        assert!(LockError::LockHeld("k".to_string()).is_retryable());
        assert!(LockError::Store("connection reset".to_string()).is_retryable());
        assert!(!LockError::NotOwner("k".to_string()).is_retryable());
        assert!(!LockError::Cancelled("k".to_string()).is_retryable());
        assert!(!LockError::NotInitialized.is_retryable());
    }
}

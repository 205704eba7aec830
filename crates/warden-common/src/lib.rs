//! Warden Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Warden components:
//! - Error types and error codes
//! - Owner id generation
//! - Common constants

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{ErrorCode, LockError};
pub use utils::{ceil_secs, new_owner_id};

/// Smallest lifetime a TTL-backed lock may be created with
pub const MIN_TTL_SECS: u64 = 1;

/// Shortest interval between two renewals of the same lock
pub const MIN_RENEW_INTERVAL_SECS: u64 = 1;

/// Default number of polling attempts a blocking TTL acquisition spreads over its timeout
pub const DEFAULT_RETRY_COUNT: u32 = 10;

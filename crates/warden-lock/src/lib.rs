//! Warden Lock - distributed mutual exclusion over coordination stores
//!
//! This crate provides:
//! - The lock coordinator interface (`lock`)
//! - A lease + transaction backend with watch-driven waiting (`lease`)
//! - A conditional-set + TTL backend with poll-driven waiting (`ttl`)
//! - Background renewal with fail-open semantics
//! - Backend configuration and construction

pub mod backend;
pub mod config;
pub mod lease;
pub mod lock;
pub mod metrics;
pub mod ttl;

pub use backend::connect;
pub use config::{Backend, Configuration, LockSettings};
pub use lock::{BackendKind, HeldLock, LockCoordinator, LockRequest, OwnerToken, RenewalHandle};
pub use warden_common::LockError;

//! Distributed lock protocol
//!
//! This module provides:
//! - Lock data model (owner tokens, requests, held locks)
//! - The coordinator interface shared by all backends
//! - Background lock renewal

mod model;
pub mod renewal;
mod service;

pub use model::*;
pub use renewal::{RenewOutcome, RenewalRegistry, Renewer, renewal_interval};
pub use service::*;
pub(crate) use service::{Deadline, bounded};

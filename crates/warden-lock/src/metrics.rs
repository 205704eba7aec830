// Metrics for lock acquisition, release and renewal
// Recorded through the `metrics` facade; the embedding application installs the exporter

use metrics::{counter, describe_counter, describe_gauge, gauge};

use warden_common::LockError;

use crate::lock::{BackendKind, HeldLock};

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    describe_counter!(
        "warden_lock_acquire_total",
        "Total number of lock acquisition attempts by result"
    );
    describe_counter!(
        "warden_lock_release_total",
        "Total number of lock releases by result"
    );
    describe_counter!(
        "warden_lock_renewal_total",
        "Total number of background lock renewals by result"
    );
    describe_gauge!(
        "warden_lock_active_renewals",
        "Number of locks currently kept alive by a renewal task"
    );

    tracing::debug!("Lock metrics initialized");
}

/// Record the outcome of an acquisition call
pub fn record_acquire(backend: BackendKind, result: &'static str) {
    counter!("warden_lock_acquire_total", "backend" => backend.as_str(), "result" => result)
        .increment(1);
}

/// Record an acquisition call by the shape of its result
pub fn record_acquire_result(backend: BackendKind, result: &Result<HeldLock, LockError>) {
    let label = match result {
        Ok(_) => "acquired",
        Err(LockError::LockHeld(_)) => "held",
        Err(LockError::Timeout { .. }) => "timeout",
        Err(LockError::Cancelled(_)) => "cancelled",
        Err(_) => "error",
    };
    record_acquire(backend, label);
}

/// Record the outcome of a release call
pub fn record_release(backend: BackendKind, result: &'static str) {
    counter!("warden_lock_release_total", "backend" => backend.as_str(), "result" => result)
        .increment(1);
}

/// Record one renewal tick
pub fn record_renewal(backend: BackendKind, result: &'static str) {
    counter!("warden_lock_renewal_total", "backend" => backend.as_str(), "result" => result)
        .increment(1);
}

/// Update the number of live renewal tasks
pub fn set_active_renewals(backend: BackendKind, count: usize) {
    gauge!("warden_lock_active_renewals", "backend" => backend.as_str()).set(count as f64);
}

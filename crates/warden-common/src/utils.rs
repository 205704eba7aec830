//! Utility functions for Warden

use std::time::Duration;

/// Generate a unique owner id for a lock attempt
///
/// # Examples
///
/// ```
/// use warden_common::new_owner_id;
///
/// assert_ne!(new_owner_id(), new_owner_id());
/// ```
pub fn new_owner_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Round a duration up to whole seconds
///
/// Coordination stores count lease and TTL lifetimes in whole seconds, so a
/// sub-second remainder is never silently dropped.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden_common::ceil_secs;
///
/// assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
/// assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
/// assert_eq!(ceil_secs(Duration::ZERO), 0);
/// ```
pub fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_id_is_uuid() {
        let id = new_owner_id();
        assert_eq!(id.len(), 36);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(999)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(2001)), 3);
    }
}

//! Reconciliation Policy
//!
//! Whole-snapshot last-write-wins. A remote snapshot replaces local state only
//! when its server timestamp is strictly newer than the local last sync.
//! Equal timestamps are this device's own write coming back (an echo); an
//! older one is a stale delivery. Updates that lose the race are discarded.

use chrono::{DateTime, Utc};

/// Decide whether to adopt a remote snapshot
pub fn reconcile(local_last_sync: Option<DateTime<Utc>>, remote_last_sync: Option<DateTime<Utc>>) -> bool {
    match (local_last_sync, remote_last_sync) {
        (None, Some(_)) => true,
        (Some(local), Some(remote)) => remote > local,
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    #[test]
    fn test_first_sync_adopts() {
        assert!(reconcile(None, t(0)));
    }

    #[test]
    fn test_echo_is_ignored() {
        assert!(!reconcile(t(5), t(5)));
    }

    #[test]
    fn test_newer_remote_adopts() {
        assert!(reconcile(t(5), t(6)));
    }

    #[test]
    fn test_older_remote_is_ignored() {
        assert!(!reconcile(t(6), t(5)));
    }

    #[test]
    fn test_missing_remote_timestamp_is_ignored() {
        assert!(!reconcile(None, None));
        assert!(!reconcile(t(1), None));
    }

    #[test]
    fn test_subsecond_ordering() {
        let local = Utc.timestamp_opt(1_700_000_000, 100_000_000).unwrap();
        let remote = Utc.timestamp_opt(1_700_000_000, 100_000_001).unwrap();
        assert!(reconcile(Some(local), Some(remote)));
    }
}

//! Next-sync interval policy
//!
//! The base interval comes from the status class; each consecutive failure
//! doubles it, up to 24 times the base. A shipment that keeps failing is
//! therefore retried at most once a day whatever its status.

use chrono::{DateTime, Duration, Utc};

use crate::models::StatusClass;

/// Upper bound on the failure backoff multiplier
pub const MAX_BACKOFF_MULTIPLIER: i32 = 24;

/// `min(2^failures, 24)`; no failures means a multiplier of 1
pub fn backoff_multiplier(failures: i32) -> i32 {
    if failures <= 0 {
        return 1;
    }
    // 2^5 already exceeds the cap
    if failures >= 5 {
        return MAX_BACKOFF_MULTIPLIER;
    }
    (1 << failures).min(MAX_BACKOFF_MULTIPLIER)
}

/// Interval until the next sync for a shipment in `class` with `failures`
pub fn sync_interval(class: StatusClass, failures: i32) -> Duration {
    class.base_interval() * backoff_multiplier(failures)
}

/// `now + base_interval(class) * min(2^failures, 24)`
pub fn next_sync_at(now: DateTime<Utc>, class: StatusClass, failures: i32) -> DateTime<Utc> {
    now + sync_interval(class, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CLASSES: [StatusClass; 5] = [
        StatusClass::Terminal,
        StatusClass::ReturnToOrigin,
        StatusClass::OutForDelivery,
        StatusClass::Undelivered,
        StatusClass::InTransit,
    ];

    #[test]
    fn test_backoff_multiplier() {
        let expected = [1, 2, 4, 8, 16, 24, 24];
        for (failures, want) in expected.iter().enumerate() {
            assert_eq!(backoff_multiplier(failures as i32), *want);
        }
        assert_eq!(backoff_multiplier(10), 24);
        assert_eq!(backoff_multiplier(-1), 1);
    }

    #[test]
    fn test_base_intervals() {
        let now = Utc::now();
        assert_eq!(
            next_sync_at(now, StatusClass::OutForDelivery, 0),
            now + Duration::minutes(30)
        );
        assert_eq!(
            next_sync_at(now, StatusClass::Terminal, 0),
            now + Duration::hours(24)
        );
        assert_eq!(
            next_sync_at(now, StatusClass::InTransit, 3),
            now + Duration::hours(8)
        );
    }

    #[test]
    fn test_persistent_failure_is_at_most_daily_for_hourly_class() {
        let now = Utc::now();
        assert_eq!(
            next_sync_at(now, StatusClass::InTransit, 9),
            now + Duration::hours(24)
        );
    }

    fn class_strategy() -> impl Strategy<Value = StatusClass> {
        (0..CLASSES.len()).prop_map(|i| CLASSES[i])
    }

    proptest! {
        #[test]
        fn prop_next_sync_matches_formula(class in class_strategy(), failures in 0i32..=10, offset in 0i64..10_000_000) {
            let now = DateTime::<Utc>::from_timestamp(1_700_000_000 + offset, 0).unwrap();
            let multiplier = 2i32.pow(failures as u32).min(24);
            prop_assert_eq!(next_sync_at(now, class, failures), now + class.base_interval() * multiplier);
        }

        #[test]
        fn prop_interval_monotonic_in_failures(class in class_strategy(), failures in 0i32..10) {
            prop_assert!(sync_interval(class, failures + 1) >= sync_interval(class, failures));
        }
    }
}

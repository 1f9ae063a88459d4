//! Common utilities and helper functions

pub mod retry;

use rand::Rng;
use std::time::Duration;

/// Truncate text to a maximum length in characters
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

/// `base` plus a uniformly random extra of up to `jitter`
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Convert a std duration into a chrono one, saturating on overflow
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("very long text here", 10), "very lo...");
        assert_eq!(truncate_text("ééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_jittered_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let d = jittered(base, Duration::from_millis(20));
            assert!(d >= base && d <= Duration::from_millis(120));
        }
        assert_eq!(jittered(base, Duration::ZERO), base);
    }

    #[test]
    fn test_chrono_duration() {
        assert_eq!(
            chrono_duration(Duration::from_secs(90)),
            chrono::Duration::seconds(90)
        );
    }
}

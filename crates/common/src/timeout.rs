//! Timeout arithmetic for blocking waits

use std::time::{Duration, Instant};

/// Remaining part of `timeout` after the time elapsed since `start`
///
/// `None` means "wait forever" and stays `None`. A finite timeout saturates
/// at zero, so loops that recompute it on every iteration never wait longer
/// in total than the caller asked for.
pub fn adjust_timeout(timeout: Option<Duration>, start: Instant) -> Option<Duration> {
    timeout.map(|t| t.saturating_sub(start.elapsed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinite_timeout_stays_infinite() {
        let start = Instant::now() - Duration::from_secs(5);
        assert_eq!(adjust_timeout(None, start), None);
    }

    #[test]
    fn test_timeout_decreases() {
        let start = Instant::now() - Duration::from_millis(300);
        let remaining = adjust_timeout(Some(Duration::from_secs(1)), start).unwrap();
        assert!(remaining <= Duration::from_millis(700));
    }

    #[test]
    fn test_elapsed_timeout_saturates() {
        let start = Instant::now() - Duration::from_secs(5);
        assert_eq!(
            adjust_timeout(Some(Duration::from_secs(1)), start),
            Some(Duration::ZERO)
        );
    }
}

//! Client-side throttle advice.
//!
//! Tracks recent request timestamps per client key so the embedding service
//! can refuse or slow down clients before they trip upstream defenses. It is
//! independent of the dispatcher.

use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::config::JitterRange;

/// Trailing window used for [`ThrottleTracker::should_throttle`].
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Requests allowed inside the throttle window.
pub const THROTTLE_LIMIT: usize = 20;
/// How long timestamps are retained.
pub const RETENTION: Duration = Duration::from_secs(60 * 60);
/// Minimum spacing between two cleanup passes.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const SAMPLE_SIZE: usize = 5;

/// Per-client request history.
#[derive(Debug, Default)]
pub struct ThrottleTracker {
    history: DashMap<String, Vec<Instant>>,
    last_cleanup: Mutex<Option<Instant>>,
}

impl ThrottleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request from `client` now.
    pub fn record(&self, client: &str) {
        self.cleanup();
        self.history
            .entry(client.to_string())
            .or_default()
            .push(Instant::now());
    }

    /// Whether `client` made at least [`THROTTLE_LIMIT`] requests in the
    /// trailing [`THROTTLE_WINDOW`].
    pub fn should_throttle(&self, client: &str) -> bool {
        self.cleanup();
        let now = Instant::now();
        self.history
            .get(client)
            .map(|times| {
                times
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < THROTTLE_WINDOW)
                    .count()
                    >= THROTTLE_LIMIT
            })
            .unwrap_or(false)
    }

    /// Delay the client should wait before its next request, based on the
    /// mean gap between its last few requests.
    pub fn suggested_delay(&self, client: &str) -> Duration {
        self.cleanup();
        let range = match self.history.get(client) {
            Some(times) if times.len() >= 2 => {
                let recent = &times[times.len().saturating_sub(SAMPLE_SIZE)..];
                let total: Duration = recent
                    .windows(2)
                    .map(|pair| pair[1].saturating_duration_since(pair[0]))
                    .sum();
                let mean = total / (recent.len() - 1) as u32;
                if mean < Duration::from_secs(2) {
                    JitterRange::from_millis(3000, 6000)
                } else if mean < Duration::from_secs(5) {
                    JitterRange::from_millis(1500, 3000)
                } else {
                    JitterRange::from_millis(500, 2000)
                }
            }
            _ => JitterRange::from_millis(500, 1500),
        };
        range.sample()
    }

    /// Drops timestamps older than [`RETENTION`].
    ///
    /// Runs at most once per [`CLEANUP_INTERVAL`]; returns whether it ran.
    pub fn cleanup(&self) -> bool {
        let now = Instant::now();
        {
            let mut last = match self.last_cleanup.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(previous) = *last {
                if now.saturating_duration_since(previous) < CLEANUP_INTERVAL {
                    return false;
                }
            }
            *last = Some(now);
        }

        self.history.retain(|_, times| {
            times.retain(|t| now.saturating_duration_since(*t) < RETENTION);
            !times.is_empty()
        });
        debug!("Throttle cleanup done, {} clients tracked", self.history.len());
        true
    }

    /// Number of clients with retained history.
    pub fn tracked_clients(&self) -> usize {
        self.history.len()
    }

    /// Number of retained timestamps for `client`.
    pub fn request_count(&self, client: &str) -> usize {
        self.history.get(client).map(|t| t.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::advance;

    fn in_range(d: Duration, min_ms: u64, max_ms: u64) -> bool {
        d >= Duration::from_millis(min_ms) && d <= Duration::from_millis(max_ms)
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_after_limit() {
        let tracker = ThrottleTracker::new();
        for _ in 0..19 {
            tracker.record("10.0.0.1");
            advance(Duration::from_secs(1)).await;
        }
        assert!(!tracker.should_throttle("10.0.0.1"));
        tracker.record("10.0.0.1");
        assert!(tracker.should_throttle("10.0.0.1"));
        assert!(!tracker.should_throttle("10.0.0.2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_expires_with_window() {
        let tracker = ThrottleTracker::new();
        for _ in 0..25 {
            tracker.record("client");
        }
        assert!(tracker.should_throttle("client"));
        advance(THROTTLE_WINDOW + Duration::from_secs(1)).await;
        assert!(!tracker.should_throttle("client"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suggested_delay_without_history() {
        let tracker = ThrottleTracker::new();
        assert!(in_range(tracker.suggested_delay("new"), 500, 1500));
        tracker.record("new");
        assert!(in_range(tracker.suggested_delay("new"), 500, 1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suggested_delay_for_rapid_client() {
        let tracker = ThrottleTracker::new();
        for _ in 0..5 {
            tracker.record("rapid");
            advance(Duration::from_millis(500)).await;
        }
        assert!(in_range(tracker.suggested_delay("rapid"), 3000, 6000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suggested_delay_for_moderate_client() {
        let tracker = ThrottleTracker::new();
        for _ in 0..3 {
            tracker.record("moderate");
            advance(Duration::from_secs(3)).await;
        }
        assert!(in_range(tracker.suggested_delay("moderate"), 1500, 3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suggested_delay_uses_last_five_only() {
        let tracker = ThrottleTracker::new();
        // Slow start, then a fast burst of five.
        for _ in 0..3 {
            tracker.record("bursty");
            advance(Duration::from_secs(60)).await;
        }
        for _ in 0..5 {
            tracker.record("bursty");
            advance(Duration::from_millis(100)).await;
        }
        assert!(in_range(tracker.suggested_delay("bursty"), 3000, 6000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suggested_delay_for_slow_client() {
        let tracker = ThrottleTracker::new();
        for _ in 0..4 {
            tracker.record("slow");
            advance(Duration::from_secs(10)).await;
        }
        assert!(in_range(tracker.suggested_delay("slow"), 500, 2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_self_throttles() {
        let tracker = ThrottleTracker::new();
        assert!(tracker.cleanup());
        advance(Duration::from_millis(500)).await;
        assert!(!tracker.cleanup());
        advance(CLEANUP_INTERVAL).await;
        assert!(tracker.cleanup());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_prunes_old_entries() {
        let tracker = ThrottleTracker::new();
        tracker.record("old");
        advance(Duration::from_secs(30 * 60)).await;
        tracker.record("fresh");
        advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(tracker.tracked_clients(), 2);

        assert!(tracker.cleanup());
        assert_eq!(tracker.tracked_clients(), 1);
        assert_eq!(tracker.request_count("old"), 0);
        assert_eq!(tracker.request_count("fresh"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_records() {
        let tracker = Arc::new(ThrottleTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    for _ in 0..10 {
                        tracker.record(&format!("client-{}", i % 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(tracker.request_count("client-0"), 40);
        assert_eq!(tracker.request_count("client-1"), 40);
    }
}

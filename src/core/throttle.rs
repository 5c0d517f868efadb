//! Per-key throttling and token-bucket rate limiting.
//!
//! A [`ThrottleManager`] is shared by every step execution of an engine. All
//! state lives behind a single mutex that is held only for the check-and-update;
//! the actual waiting happens on a `tokio` timer outside the lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_time: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(calls: u32, per: Duration, now: Instant) -> Self {
        Self {
            tokens: calls as f64,
            capacity: calls as f64,
            refill_time: per,
            last_refill: now,
        }
    }

    /// Adopt a changed `{calls, per}` declaration without losing the fill level.
    fn reconfigure(&mut self, calls: u32, per: Duration) {
        let capacity = calls as f64;
        if (self.capacity - capacity).abs() > f64::EPSILON || self.refill_time != per {
            self.capacity = capacity;
            self.refill_time = per;
            self.tokens = self.tokens.min(capacity);
        }
    }

    fn rate_per_sec(&self) -> f64 {
        self.capacity / self.refill_time.as_secs_f64()
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec()).min(self.capacity);
        self.last_refill = now;
    }

    fn has_token(&self) -> bool {
        self.tokens + TOKEN_EPSILON >= 1.0
    }

    fn time_until_token(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.rate_per_sec())
    }
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_execution: HashMap<String, Instant>,
    buckets: HashMap<String, TokenBucket>,
}

/// Process-wide throttle and rate-limit state, keyed by caller-chosen strings.
///
/// None of the operations fail; the blocking variants only ever delay.
#[derive(Debug, Default)]
pub struct ThrottleManager {
    state: Mutex<ThrottleState>,
}

impl ThrottleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `min_interval` has passed since the previous call with the
    /// same key and returns the time actually waited.
    ///
    /// The slot is reserved under the lock, so concurrent callers sharing a key
    /// are spaced `min_interval` apart in arrival order.
    pub async fn throttle(&self, key: &str, min_interval: Duration) -> Duration {
        let wait = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let wait = match state.last_execution.get(key) {
                Some(last) => (*last + min_interval).saturating_duration_since(now),
                None => Duration::ZERO,
            };
            state.last_execution.insert(key.to_string(), now + wait);
            wait
        };

        if !wait.is_zero() {
            tracing::debug!(key, wait_ms = wait.as_millis() as u64, "throttling");
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Time left before `throttle(key, min_interval)` would proceed without waiting.
    pub fn throttle_remaining(&self, key: &str, min_interval: Duration) -> Duration {
        let state = self.state.lock();
        match state.last_execution.get(key) {
            Some(last) => (*last + min_interval).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Acquires one token from the bucket for `key`, refilled linearly at
    /// `calls` tokens per `per`. Returns the time spent waiting.
    pub async fn rate_limit(&self, key: &str, calls: u32, per: Duration) -> Duration {
        if calls == 0 || per.is_zero() {
            return Duration::ZERO;
        }

        let started = Instant::now();
        loop {
            let shortfall = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let bucket = state
                    .buckets
                    .entry(key.to_string())
                    .or_insert_with(|| TokenBucket::new(calls, per, now));
                bucket.reconfigure(calls, per);
                bucket.refill(now);
                if bucket.has_token() {
                    bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                    None
                } else {
                    Some(bucket.time_until_token())
                }
            };

            match shortfall {
                None => return started.elapsed(),
                Some(wait) => {
                    tracing::debug!(key, wait_ms = wait.as_millis() as u64, "rate limited");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Whether a token is available right now. Does not consume it.
    pub fn rate_limit_available(&self, key: &str, calls: u32, per: Duration) -> bool {
        if calls == 0 || per.is_zero() {
            return true;
        }
        let state = self.state.lock();
        match state.buckets.get(key) {
            Some(bucket) => {
                let mut peek = bucket.clone();
                peek.reconfigure(calls, per);
                peek.refill(Instant::now());
                peek.has_token()
            }
            None => true,
        }
    }

    pub fn reset_throttle(&self, key: &str) {
        self.state.lock().last_execution.remove(key);
    }

    pub fn reset_rate_limit(&self, key: &str) {
        self.state.lock().buckets.remove(key);
    }

    pub fn reset_all(&self) {
        let mut state = self.state.lock();
        state.last_execution.clear();
        state.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_throttle_first_call_does_not_wait() {
        let manager = ThrottleManager::new();
        let waited = manager.throttle("k", Duration::from_secs(1)).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_spaces_consecutive_calls() {
        let manager = ThrottleManager::new();
        let start = Instant::now();
        manager.throttle("k", Duration::from_secs(1)).await;
        let waited = manager.throttle("k", Duration::from_secs(1)).await;
        assert_eq!(waited, Duration::from_secs(1));
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_keys_are_independent() {
        let manager = ThrottleManager::new();
        manager.throttle("a", Duration::from_secs(5)).await;
        let waited = manager.throttle("b", Duration::from_secs(5)).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_concurrent_callers_are_serialized() {
        let manager = Arc::new(ThrottleManager::new());
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.throttle("shared", Duration::from_millis(500)).await;
                Instant::now()
            }));
        }
        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap());
        }
        finished.sort();
        assert!(finished[1].duration_since(finished[0]) >= Duration::from_millis(500));
        assert!(finished[2].duration_since(finished[1]) >= Duration::from_millis(500));
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_remaining() {
        let manager = ThrottleManager::new();
        assert_eq!(
            manager.throttle_remaining("k", Duration::from_secs(2)),
            Duration::ZERO
        );
        manager.throttle("k", Duration::from_secs(2)).await;
        assert_eq!(
            manager.throttle_remaining("k", Duration::from_secs(2)),
            Duration::from_secs(2)
        );
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(
            manager.throttle_remaining("k", Duration::from_secs(2)),
            Duration::from_millis(500)
        );
        manager.reset_throttle("k");
        assert_eq!(
            manager.throttle_remaining("k", Duration::from_secs(2)),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_allows_capacity_then_blocks() {
        let manager = ThrottleManager::new();
        for _ in 0..3 {
            let waited = manager.rate_limit("api", 3, Duration::from_secs(1)).await;
            assert_eq!(waited, Duration::ZERO);
        }
        assert!(!manager.rate_limit_available("api", 3, Duration::from_secs(1)));
        let waited = manager.rate_limit("api", 3, Duration::from_secs(1)).await;
        assert!(waited > Duration::ZERO);
        assert!(waited <= Duration::from_millis(334));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_window_never_exceeds_calls() {
        let manager = ThrottleManager::new();
        let per = Duration::from_secs(2);
        let start = Instant::now();
        let mut unblocked_in_window = 0;
        for _ in 0..10 {
            let waited = manager.rate_limit("window", 4, per).await;
            if waited.is_zero() && start.elapsed() < per {
                unblocked_in_window += 1;
            }
        }
        assert!(unblocked_in_window <= 4);
        // 10 acquisitions at 2 tokens/sec with a burst of 4 take at least 3s.
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_available_does_not_consume() {
        let manager = ThrottleManager::new();
        manager.rate_limit("peek", 1, Duration::from_secs(10)).await;
        assert!(!manager.rate_limit_available("peek", 1, Duration::from_secs(10)));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(manager.rate_limit_available("peek", 1, Duration::from_secs(10)));
        assert!(manager.rate_limit_available("peek", 1, Duration::from_secs(10)));
        let waited = manager.rate_limit("peek", 1, Duration::from_secs(10)).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_clears_state() {
        let manager = ThrottleManager::new();
        manager.rate_limit("r", 1, Duration::from_secs(60)).await;
        manager.throttle("t", Duration::from_secs(60)).await;
        manager.reset_all();
        assert!(manager.rate_limit_available("r", 1, Duration::from_secs(60)));
        assert_eq!(
            manager.throttle_remaining("t", Duration::from_secs(60)),
            Duration::ZERO
        );
    }
}

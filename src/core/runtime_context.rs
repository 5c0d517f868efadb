use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::event_bus::{EventEmitter, EventSender};

/// Runtime context providing wall-clock time, ID generation and the optional
/// engine event channel.
#[derive(Clone)]
pub struct RuntimeContext {
    pub time_provider: Arc<dyn TimeProvider>,
    pub id_generator: Arc<dyn IdGenerator>,
    pub events: EventEmitter,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            time_provider: Arc::new(RealTimeProvider),
            id_generator: Arc::new(RealIdGenerator),
            events: EventEmitter::default(),
        }
    }
}

impl RuntimeContext {
    pub fn with_event_tx(mut self, event_tx: EventSender) -> Self {
        self.events = EventEmitter::new(event_tx);
        self
    }

    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.time_provider.now()
    }
}

pub trait TimeProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

// --- Real implementations ---

#[derive(Debug, Default, Clone, Copy)]
pub struct RealTimeProvider;

impl TimeProvider for RealTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealIdGenerator;

impl IdGenerator for RealIdGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

// --- Fake implementations ---

/// Manually advanced clock.
pub struct FakeTimeProvider {
    millis: AtomicI64,
}

impl FakeTimeProvider {
    pub fn new(fixed_timestamp: i64) -> Self {
        Self {
            millis: AtomicI64::new(fixed_timestamp.saturating_mul(1000)),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        self.millis
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl TimeProvider for FakeTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
    }
}

pub struct FakeIdGenerator {
    pub prefix: String,
    pub counter: AtomicU64,
}

impl FakeIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for FakeIdGenerator {
    fn next_id(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, id)
    }
}

/// Whole-millisecond difference between two timestamps, clamped at zero.
pub fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    let diff: ChronoDuration = end - start;
    diff.num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fake_time_provider_advances() {
        let clock = FakeTimeProvider::new(1_700_000_000);
        let before = clock.now();
        clock.advance(Duration::from_secs(90));
        let after = clock.now();
        assert_eq!(millis_between(before, after), 90_000);
        assert_eq!(clock.now_millis(), 1_700_000_090_000);
    }

    #[test]
    fn test_fake_id_generator_sequence() {
        let ids = FakeIdGenerator::new("exec");
        assert_eq!(ids.next_id(), "exec-0");
        assert_eq!(ids.next_id(), "exec-1");
    }

    #[test]
    fn test_millis_between_clamps_negative() {
        let clock = FakeTimeProvider::new(100);
        let later = clock.now();
        let earlier = FakeTimeProvider::new(50).now();
        assert_eq!(millis_between(later, earlier), 0);
    }
}

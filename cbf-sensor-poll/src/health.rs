use crate::state::{new_state, Shared};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerHealth {
    pub uptime_seconds: u64,
    pub state: String,
    pub poll_cycles: u64,
    pub poll_failures: u64,
    pub reconnects: u32,
    pub last_successful_write: Option<DateTime<Utc>>,
}

/// Cheap to clone; every clone updates the same counters
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    poll_cycles: Arc<AtomicU64>,
    poll_failures: Arc<AtomicU64>,
    reconnects: Arc<AtomicU32>,
    state: Shared<String>,
    last_write: Shared<Option<DateTime<Utc>>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            poll_cycles: Arc::new(AtomicU64::new(0)),
            poll_failures: Arc::new(AtomicU64::new(0)),
            reconnects: Arc::new(AtomicU32::new(0)),
            state: new_state("idle".to_string()),
            last_write: new_state(None),
        }
    }

    pub fn set_state(&self, state: impl ToString) {
        *self.state.lock() = state.to_string();
    }

    pub fn state(&self) -> String {
        self.state.lock().clone()
    }

    pub fn record_cycle(&self) {
        self.poll_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_write(&self) {
        *self.last_write.lock() = Some(Utc::now());
    }

    pub fn last_successful_write(&self) -> Option<DateTime<Utc>> {
        *self.last_write.lock()
    }

    pub fn get_health(&self) -> PollerHealth {
        PollerHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            state: self.state(),
            poll_cycles: self.poll_cycles.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_successful_write: self.last_successful_write(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let tracker = HealthTracker::new();
        let other = tracker.clone();
        other.record_cycle();
        other.record_failure();
        other.increment_reconnects();
        other.set_state("polling");

        let health = tracker.get_health();
        assert_eq!(health.poll_cycles, 1);
        assert_eq!(health.poll_failures, 1);
        assert_eq!(health.reconnects, 1);
        assert_eq!(health.state, "polling");
        assert!(health.last_successful_write.is_none());
    }

    #[test]
    fn test_mark_write() {
        let tracker = HealthTracker::new();
        let before = Utc::now();
        tracker.mark_write();
        let written = tracker.last_successful_write().unwrap();
        assert!(written >= before);
    }
}

//! Hybrid logical clock.
//!
//! A [`HybridTimestamp`] pairs a wall-clock reading (milliseconds since the
//! Unix epoch) with a 16-bit logical counter and a node id. Ordering is
//! lexicographic on `(physical_time, logical_counter, node_id)`.
//!
//! ```text
//! update():        pt' = max(now, pt)            lc' = pt' == pt ? lc + 1 : 0
//! update(other):   pt' = max(now, pt, other.pt)  lc' = counter of whichever
//!                                                     side(s) pt' came from, + 1
//! ```
//!
//! Clock skew never produces an error: a wall clock that moves backwards is
//! absorbed by the `max`, and the logical counter carries the ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// PHYSICAL TIME
// ============================================================================

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait PhysicalTimeProvider: Send + Sync {
    fn physical_time(&self) -> u64;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl PhysicalTimeProvider for SystemTimeProvider {
    fn physical_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualTimeProvider {
    now: AtomicU64,
}

impl ManualTimeProvider {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, AtomicOrdering::SeqCst);
    }
}

impl PhysicalTimeProvider for ManualTimeProvider {
    fn physical_time(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

// ============================================================================
// HYBRID TIMESTAMP
// ============================================================================

/// Causal timestamp. `Copy`, so holders never alias each other's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    physical_time: u64,
    logical_counter: u16,
    node_id: u16,
}

impl HybridTimestamp {
    pub const fn new(physical_time: u64, logical_counter: u16, node_id: u16) -> Self {
        Self {
            physical_time,
            logical_counter,
            node_id,
        }
    }

    /// A fresh timestamp read from `provider`.
    pub fn now(provider: &dyn PhysicalTimeProvider, node_id: u16) -> Self {
        Self::new(provider.physical_time(), 0, node_id)
    }

    pub fn physical_time(&self) -> u64 {
        self.physical_time
    }

    pub fn logical_counter(&self) -> u16 {
        self.logical_counter
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Advance for a local event.
    pub fn update(&mut self, provider: &dyn PhysicalTimeProvider) {
        let now = provider.physical_time();
        if now > self.physical_time {
            self.physical_time = now;
            self.logical_counter = 0;
        } else {
            self.tick(self.logical_counter);
        }
    }

    /// Merge causal knowledge from `other` so that the result orders after both.
    pub fn update_from(&mut self, other: &HybridTimestamp, provider: &dyn PhysicalTimeProvider) {
        let now = provider.physical_time();
        let own = self.physical_time;
        let physical = now.max(own).max(other.physical_time);

        let counter = if physical == own && physical == other.physical_time {
            Some(self.logical_counter.max(other.logical_counter))
        } else if physical == own {
            Some(self.logical_counter)
        } else if physical == other.physical_time {
            Some(other.logical_counter)
        } else {
            None
        };

        self.physical_time = physical;
        match counter {
            Some(counter) => self.tick(counter),
            None => self.logical_counter = 0,
        }
    }

    /// Set the counter to `base + 1`, carrying into physical time on overflow.
    /// Saturates at the largest representable timestamp.
    fn tick(&mut self, base: u16) {
        match base.checked_add(1) {
            Some(next) => self.logical_counter = next,
            None => match self.physical_time.checked_add(1) {
                Some(physical) => {
                    self.physical_time = physical;
                    self.logical_counter = 0;
                }
                None => self.logical_counter = u16::MAX,
            },
        }
    }

    /// Physical component as a UTC date-time, if representable.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.physical_time)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_time
            .cmp(&other.physical_time)
            .then(self.logical_counter.cmp(&other.logical_counter))
            .then(self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(
                f,
                "{}+{}@{}",
                dt.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                self.logical_counter,
                self.node_id
            ),
            None => write!(
                f,
                "{}+{}@{}",
                self.physical_time, self.logical_counter, self.node_id
            ),
        }
    }
}

// ============================================================================
// HYBRID CLOCK
// ============================================================================

/// A timestamp bound to its physical time source.
///
/// The repository owns exactly one of these behind a mutex; the pipeline's
/// timestamping stage and the commit path are its only writers.
pub struct HybridClock {
    provider: std::sync::Arc<dyn PhysicalTimeProvider>,
    current: HybridTimestamp,
}

impl HybridClock {
    pub fn new(provider: std::sync::Arc<dyn PhysicalTimeProvider>) -> Self {
        Self::with_node_id(provider, 0)
    }

    pub fn with_node_id(provider: std::sync::Arc<dyn PhysicalTimeProvider>, node_id: u16) -> Self {
        let current = HybridTimestamp::now(provider.as_ref(), node_id);
        Self { provider, current }
    }

    pub fn update(&mut self) -> HybridTimestamp {
        self.current.update(self.provider.as_ref());
        self.current
    }

    pub fn update_from(&mut self, other: &HybridTimestamp) -> HybridTimestamp {
        self.current.update_from(other, self.provider.as_ref());
        self.current
    }

    pub fn timestamp(&self) -> HybridTimestamp {
        self.current
    }

    pub fn provider(&self) -> &std::sync::Arc<dyn PhysicalTimeProvider> {
        &self.provider
    }
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_update_without_wall_clock_advance_bumps_counter() {
        let time = ManualTimeProvider::new(1_000);
        let mut ts = HybridTimestamp::now(&time, 0);
        ts.update(&time);
        assert_eq!(ts.physical_time(), 1_000);
        assert_eq!(ts.logical_counter(), 1);
        ts.update(&time);
        assert_eq!(ts.logical_counter(), 2);
    }

    #[test]
    fn test_update_with_wall_clock_advance_resets_counter() {
        let time = ManualTimeProvider::new(1_000);
        let mut ts = HybridTimestamp::now(&time, 0);
        ts.update(&time);
        time.advance(5);
        ts.update(&time);
        assert_eq!(ts.physical_time(), 1_005);
        assert_eq!(ts.logical_counter(), 0);
    }

    #[test]
    fn test_update_absorbs_backwards_wall_clock() {
        let time = ManualTimeProvider::new(1_000);
        let mut ts = HybridTimestamp::now(&time, 0);
        time.set(500);
        let before = ts;
        ts.update(&time);
        assert_eq!(ts.physical_time(), 1_000);
        assert!(before < ts);
    }

    #[test]
    fn test_update_from_equal_physical_takes_max_counter() {
        let time = ManualTimeProvider::new(10);
        let mut a = HybridTimestamp::new(100, 3, 0);
        let b = HybridTimestamp::new(100, 7, 1);
        a.update_from(&b, &time);
        assert_eq!(a.physical_time(), 100);
        assert_eq!(a.logical_counter(), 8);
    }

    #[test]
    fn test_update_from_remote_ahead_takes_remote_counter() {
        let time = ManualTimeProvider::new(10);
        let mut a = HybridTimestamp::new(100, 9, 0);
        let b = HybridTimestamp::new(200, 4, 0);
        a.update_from(&b, &time);
        assert_eq!(a.physical_time(), 200);
        assert_eq!(a.logical_counter(), 5);
    }

    #[test]
    fn test_update_from_local_ahead_keeps_local_counter() {
        let time = ManualTimeProvider::new(10);
        let mut a = HybridTimestamp::new(300, 2, 0);
        let b = HybridTimestamp::new(200, 40, 0);
        a.update_from(&b, &time);
        assert_eq!(a.physical_time(), 300);
        assert_eq!(a.logical_counter(), 3);
    }

    #[test]
    fn test_update_from_fresh_wall_clock_resets_counter() {
        let time = ManualTimeProvider::new(1_000);
        let mut a = HybridTimestamp::new(300, 2, 0);
        let b = HybridTimestamp::new(200, 40, 0);
        a.update_from(&b, &time);
        assert_eq!(a.physical_time(), 1_000);
        assert_eq!(a.logical_counter(), 0);
    }

    #[test]
    fn test_counter_overflow_carries_into_physical() {
        let time = ManualTimeProvider::new(0);
        let mut ts = HybridTimestamp::new(50, u16::MAX, 0);
        let before = ts;
        ts.update(&time);
        assert_eq!(ts.physical_time(), 51);
        assert_eq!(ts.logical_counter(), 0);
        assert!(before < ts);
    }

    #[test]
    fn test_tick_saturates_at_maximum() {
        let time = ManualTimeProvider::new(0);
        let max = HybridTimestamp::new(u64::MAX, u16::MAX, 0);
        let mut ts = max;
        ts.update(&time);
        assert_eq!(ts, max);

        let mut clock = HybridClock::new(Arc::new(time));
        assert_eq!(clock.update_from(&max), max);
        assert_eq!(clock.update(), max);
    }

    #[test]
    fn test_ordering_uses_node_id_as_tiebreak() {
        let a = HybridTimestamp::new(1, 1, 0);
        let b = HybridTimestamp::new(1, 1, 1);
        assert!(a < b);
        assert!(HybridTimestamp::new(1, 2, 0) > b);
        assert!(HybridTimestamp::new(2, 0, 0) > HybridTimestamp::new(1, u16::MAX, 9));
    }

    #[test]
    fn test_clock_returns_copies() {
        let time = Arc::new(ManualTimeProvider::new(10));
        let mut clock = HybridClock::new(time.clone());
        let first = clock.update();
        let second = clock.update();
        assert!(first < second);
        assert_eq!(clock.timestamp(), second);
    }

    #[test]
    fn test_display_includes_counter_and_node() {
        let ts = HybridTimestamp::new(0, 4, 2);
        assert_eq!(ts.to_string(), "1970-01-01T00:00:00.000Z+4@2");
    }

    proptest! {
        #[test]
        fn prop_update_from_orders_after_both(
            own_pt in 0u64..1_000_000,
            own_lc in any::<u16>(),
            other_pt in 0u64..1_000_000,
            other_lc in any::<u16>(),
            now in 0u64..1_000_000,
        ) {
            let time = ManualTimeProvider::new(now);
            let mut ts = HybridTimestamp::new(own_pt, own_lc, 0);
            let before = ts;
            let other = HybridTimestamp::new(other_pt, other_lc, 0);
            ts.update_from(&other, &time);
            prop_assert!(before < ts);
            prop_assert!(other < ts);
        }

        #[test]
        fn prop_update_is_strictly_monotonic(
            start in 0u64..1_000_000,
            steps in proptest::collection::vec(-5i64..5, 1..50),
        ) {
            let time = ManualTimeProvider::new(start);
            let mut ts = HybridTimestamp::now(&time, 0);
            for step in steps {
                let next = (time.physical_time() as i64 + step).max(0) as u64;
                time.set(next);
                let before = ts;
                ts.update(&time);
                prop_assert!(before < ts);
            }
        }
    }
}

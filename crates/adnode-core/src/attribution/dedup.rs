//! Bounded dedup window keyed on `(link_token, fingerprint)`.
//!
//! Entries hold the monotonic [`Instant`] of the accepted visit. A repeat
//! inside the window is a duplicate; once the window has passed the pair may
//! be accepted again.
//!
//! # Memory Management
//!
//! - **Periodic cleanup**: every `cleanup_interval` checks, expired entries
//!   are dropped.
//! - **Hard cap**: at most `max_tracked_keys` pairs are tracked. A new pair
//!   arriving at the cap forces a cleanup; if the window is still full the
//!   visit is refused with [`DedupDecision::Full`] rather than accepted
//!   without dedup protection.
//!
//! # Concurrency
//!
//! The map is split into shards so concurrent requests for different pairs
//! rarely contend. The check and the insert for one pair happen under a
//! single shard lock, so two racing requests for the same pair cannot both
//! be accepted.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::MonotonicClock;

const SHARDS: usize = 16;

type DedupKey = (String, String);

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// First sighting inside the window; the pair is now tracked.
    First,
    /// Seen inside the window.
    Duplicate,
    /// Window is at capacity and the pair is not tracked.
    Full,
}

/// Dedup window configuration.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Window length.
    pub window: Duration,
    /// Hard cap on tracked pairs.
    pub max_tracked_keys: usize,
    /// Cleanup every N checks.
    pub cleanup_interval: u64,
}

/// Sharded dedup window.
pub struct DedupWindow {
    config: DedupConfig,
    clock: Arc<dyn MonotonicClock>,
    shards: Vec<Mutex<HashMap<DedupKey, Instant>>>,
    tracked: AtomicUsize,
    checks: AtomicU64,
}

impl DedupWindow {
    /// Creates an empty window.
    #[must_use]
    pub fn new(config: DedupConfig, clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            config,
            clock,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            tracked: AtomicUsize::new(0),
            checks: AtomicU64::new(0),
        }
    }

    /// Window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.config.window
    }

    /// Number of tracked pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracked.load(Ordering::Relaxed)
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks a pair and records it if it is new.
    pub fn check_and_record(&self, link_token: &str, fingerprint: &str) -> DedupDecision {
        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            tracing::debug!(checks = count, "running periodic dedup cleanup");
            self.cleanup();
        }

        let now = self.clock.now();
        let key = (link_token.to_string(), fingerprint.to_string());
        let shard = self.shard(&key);

        {
            let mut map = shard.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(seen) = map.get_mut(&key) {
                if now.saturating_duration_since(*seen) < self.config.window {
                    return DedupDecision::Duplicate;
                }
                // Window passed: this visit opens a new window.
                *seen = now;
                return DedupDecision::First;
            }
            if self.try_reserve() {
                map.insert(key, now);
                return DedupDecision::First;
            }
        }

        tracing::debug!(
            max_tracked_keys = self.config.max_tracked_keys,
            "dedup window full, forcing cleanup"
        );
        self.cleanup();

        let mut map = shard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(seen) = map.get(&key) {
            // Raced with another request for the same pair.
            if now.saturating_duration_since(*seen) < self.config.window {
                return DedupDecision::Duplicate;
            }
        }
        if self.try_reserve() {
            map.insert(key, now);
            DedupDecision::First
        } else {
            tracing::warn!(
                max_tracked_keys = self.config.max_tracked_keys,
                "dedup window at capacity, refusing new visitor"
            );
            DedupDecision::Full
        }
    }

    /// Forgets a pair recorded by a visit that could not be persisted.
    pub fn forget(&self, link_token: &str, fingerprint: &str) {
        let key = (link_token.to_string(), fingerprint.to_string());
        let mut map = self
            .shard(&key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if map.remove(&key).is_some() {
            self.tracked.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Records a pair accepted `age` ago, e.g. by a previous process.
    ///
    /// Entries older than the window, or beyond capacity, are skipped.
    /// Returns whether the pair is now tracked.
    pub fn seed(&self, link_token: &str, fingerprint: &str, age: Duration) -> bool {
        if age >= self.config.window {
            return false;
        }
        let now = self.clock.now();
        let seen = now.checked_sub(age).unwrap_or(now);
        let key = (link_token.to_string(), fingerprint.to_string());
        let mut map = self
            .shard(&key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match map.get_mut(&key) {
            Some(existing) => {
                *existing = (*existing).max(seen);
                true
            },
            None if self.try_reserve() => {
                map.insert(key, seen);
                true
            },
            None => false,
        }
    }

    /// Drops entries whose window has passed.
    pub fn cleanup(&self) {
        let now = self.clock.now();
        let mut removed = 0usize;
        for shard in &self.shards {
            let mut map = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let before = map.len();
            map.retain(|_, seen| now.saturating_duration_since(*seen) < self.config.window);
            removed += before - map.len();
        }
        if removed > 0 {
            self.tracked.fetch_sub(removed, Ordering::Relaxed);
            tracing::debug!(removed, remaining = self.len(), "dedup cleanup");
        }
    }

    fn try_reserve(&self) -> bool {
        self.tracked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_tracked_keys).then_some(n + 1)
            })
            .is_ok()
    }

    fn shard(&self, key: &DedupKey) -> &Mutex<HashMap<DedupKey, Instant>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)] // modulo SHARDS fits usize
        let index = (hasher.finish() % SHARDS as u64) as usize;
        &self.shards[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn window(max: usize) -> (ManualClock, DedupWindow) {
        let clock = ManualClock::new();
        let window = DedupWindow::new(
            DedupConfig {
                window: Duration::from_secs(60),
                max_tracked_keys: max,
                cleanup_interval: 1000,
            },
            Arc::new(clock.clone()),
        );
        (clock, window)
    }

    #[test]
    fn repeat_within_window_is_duplicate() {
        let (clock, window) = window(10);
        assert_eq!(window.check_and_record("t", "f"), DedupDecision::First);
        assert_eq!(window.check_and_record("t", "f"), DedupDecision::Duplicate);
        clock.advance(Duration::from_secs(59));
        assert_eq!(window.check_and_record("t", "f"), DedupDecision::Duplicate);
        assert_eq!(window.check_and_record("t", "g"), DedupDecision::First);
        assert_eq!(window.check_and_record("u", "f"), DedupDecision::First);
    }

    #[test]
    fn window_reopens_after_expiry() {
        let (clock, window) = window(10);
        assert_eq!(window.check_and_record("t", "f"), DedupDecision::First);
        clock.advance(Duration::from_secs(60));
        assert_eq!(window.check_and_record("t", "f"), DedupDecision::First);
        assert_eq!(window.check_and_record("t", "f"), DedupDecision::Duplicate);
    }

    #[test]
    fn capacity_is_a_hard_cap() {
        let (clock, window) = window(2);
        assert_eq!(window.check_and_record("t", "a"), DedupDecision::First);
        assert_eq!(window.check_and_record("t", "b"), DedupDecision::First);
        assert_eq!(window.check_and_record("t", "c"), DedupDecision::Full);
        // tracked pairs still dedup while full
        assert_eq!(window.check_and_record("t", "a"), DedupDecision::Duplicate);
        assert_eq!(window.len(), 2);

        clock.advance(Duration::from_secs(61));
        assert_eq!(window.check_and_record("t", "c"), DedupDecision::First);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn seed_respects_age() {
        let (clock, window) = window(10);
        assert!(window.seed("t", "f", Duration::from_secs(50)));
        assert!(!window.seed("t", "old", Duration::from_secs(60)));
        assert_eq!(window.check_and_record("t", "f"), DedupDecision::Duplicate);
        assert_eq!(window.check_and_record("t", "old"), DedupDecision::First);

        clock.advance(Duration::from_secs(10));
        assert_eq!(window.check_and_record("t", "f"), DedupDecision::First);
    }

    #[test]
    fn forget_releases_capacity() {
        let (_, window) = window(1);
        assert_eq!(window.check_and_record("t", "a"), DedupDecision::First);
        window.forget("t", "a");
        assert!(window.is_empty());
        assert_eq!(window.check_and_record("t", "b"), DedupDecision::First);
    }

    #[test]
    fn concurrent_checks_accept_once() {
        let (_, window) = window(100);
        let window = Arc::new(window);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || window.check_and_record("t", "f"))
            })
            .collect();
        let firsts = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|d| *d == DedupDecision::First)
            .count();
        assert_eq!(firsts, 1);
    }
}

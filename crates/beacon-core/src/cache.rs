//! Short-lived response cache.
//!
//! Holds the most recent value fetched from the backend together with the
//! time it was stored. Readers get the value back only while it is younger
//! than the configured TTL.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// A single cached value with a time-to-live.
#[derive(Debug)]
pub struct ResponseCache<T> {
    slot: RwLock<Option<(T, Instant)>>,
    ttl: Duration,
}

impl<T: Clone> ResponseCache<T> {
    /// Create an empty cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: RwLock::new(None),
            ttl,
        }
    }

    /// Get the TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a value fetched at `stored_at`.
    pub fn put(&self, value: T, stored_at: Instant) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some((value, stored_at));
    }

    /// Get the value if it is still fresh at `now`.
    #[must_use]
    pub fn get(&self, now: Instant) -> Option<T> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref()
            .filter(|(_, stored_at)| now.saturating_duration_since(*stored_at) < self.ttl)
            .map(|(value, _)| value.clone())
    }

    /// Get the age of the stored value, fresh or not.
    #[must_use]
    pub fn age(&self, now: Instant) -> Option<Duration> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref()
            .map(|(_, stored_at)| now.saturating_duration_since(*stored_at))
    }

    /// Drop the stored value.
    pub fn invalidate(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_until_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(cache.get(t0).is_none());

        cache.put(vec![1, 2, 3], t0);
        assert_eq!(cache.get(t0 + Duration::from_secs(4)), Some(vec![1, 2, 3]));
        assert!(cache.get(t0 + Duration::from_secs(5)).is_none());
        assert_eq!(cache.age(t0 + Duration::from_secs(7)), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_put_replaces_and_invalidate_clears() {
        let cache = ResponseCache::new(Duration::from_secs(5));
        let t0 = Instant::now();

        cache.put("a", t0);
        cache.put("b", t0 + Duration::from_secs(1));
        assert_eq!(cache.get(t0 + Duration::from_secs(5)), Some("b"));

        cache.invalidate();
        assert!(cache.get(t0 + Duration::from_secs(1)).is_none());
        assert!(cache.age(t0).is_none());
    }
}

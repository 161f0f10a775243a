//! Bounded window of recently seen idempotency keys.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;

/// Drops redelivered platform callbacks.
///
/// Holds the most recent `capacity` keys; a key that fell out of the window
/// is treated as new again and the collector's own deduplication takes over.
pub struct Deduplicator {
    seen: Mutex<LruCache<String, ()>>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Record `key`; returns `true` only the first time it is seen in the window.
    pub fn first_sighting(&self, key: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.get(key).is_some() {
            return false;
        }
        seen.put(key.to_owned(), ());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_key_is_rejected() {
        let dedup = Deduplicator::new(8);
        assert!(dedup.first_sighting("a"));
        assert!(!dedup.first_sighting("a"));
        assert!(dedup.first_sighting("b"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn oldest_key_is_evicted_past_capacity() {
        let dedup = Deduplicator::new(2);
        assert!(dedup.first_sighting("a"));
        assert!(dedup.first_sighting("b"));
        assert!(dedup.first_sighting("c"));
        // "a" fell out of the window.
        assert!(dedup.first_sighting("a"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn lookup_refreshes_recency() {
        let dedup = Deduplicator::new(2);
        dedup.first_sighting("a");
        dedup.first_sighting("b");
        assert!(!dedup.first_sighting("a"));
        dedup.first_sighting("c");
        // "b" was least recently used, not "a".
        assert!(!dedup.first_sighting("a"));
        assert!(dedup.first_sighting("b"));
    }

    #[test]
    fn zero_capacity_still_holds_one_key() {
        let dedup = Deduplicator::new(0);
        assert!(dedup.first_sighting("a"));
        assert!(!dedup.first_sighting("a"));
        assert!(!dedup.is_empty());
    }
}

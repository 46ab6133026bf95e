// =============================================================================
// Idempotency Cache — TTL-bounded dedup set for at-least-once consumption
// =============================================================================
//
// Concurrent insert-if-absent semantics: the first caller to present a key
// wins, all later callers within the TTL observe a duplicate. The cache is
// capacity-bounded; when full it prunes expired entries first, then evicts
// oldest-first.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

pub struct IdempotencyCache {
    inner: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
    capacity: usize,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Record `key` at `now`. Returns `true` if the key was already present
    /// and unexpired (i.e. the record is a duplicate).
    pub fn check_and_insert(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut map = self.inner.lock();

        if let Some(&seen_at) = map.get(key) {
            if now - seen_at < self.ttl {
                return true;
            }
        }

        if map.len() >= self.capacity {
            Self::prune(&mut map, now, self.ttl, self.capacity);
        }

        map.insert(key.to_string(), now);
        false
    }

    /// Drop expired entries; if still at capacity, evict the oldest half.
    fn prune(
        map: &mut HashMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
        ttl: Duration,
        capacity: usize,
    ) {
        let before = map.len();
        map.retain(|_, &mut seen_at| now - seen_at < ttl);

        if map.len() >= capacity {
            let mut entries: Vec<(String, DateTime<Utc>)> =
                map.iter().map(|(k, v)| (k.clone(), *v)).collect();
            entries.sort_by_key(|(_, t)| *t);
            for (key, _) in entries.iter().take(map.len() - capacity / 2) {
                map.remove(key);
            }
        }

        debug!(before, after = map.len(), "idempotency cache pruned");
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

//! LRU cache with optional TTL expiry and memory-bounded eviction.
//!
//! The structure is a hash-map index into an arena of nodes linked into a
//! doubly-linked recency list bracketed by two sentinels. The map owns the
//! key→slot association; the list expresses recency through slot indices,
//! so every reposition is O(1) and there is no shared ownership between the
//! two views.
//!
//! Expiry is enforced lazily on access and by a periodic sweep task that
//! walks from the cold end, yielding between chunks so it never starves
//! other work and never keeps the process alive on its own.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::value::{Value, estimate_size};

/// Hard cap on evictions per insert, so one oversized value cannot spin the
/// eviction loop forever.
const MAX_EVICTIONS_PER_SET: usize = 1000;

/// Nodes examined per sweep chunk before yielding.
const SWEEP_CHUNK: usize = 64;

/// Fixed per-node accounting overhead added to the value estimate.
const ENTRY_OVERHEAD: usize = 64;

/// Cache sizing and expiry configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entry count.
    pub max_size: usize,
    /// Maximum estimated memory in bytes.
    pub max_memory_bytes: usize,
    /// Default entry TTL. `None` disables expiry.
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_memory_bytes: 100 * 1024 * 1024,
            default_ttl: None,
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub memory_bytes: usize,
}

impl CacheStats {
    /// Hit rate in `[0, 1]`; zero when no lookups happened yet.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Node {
    key: String,
    value: Value,
    expires_at: Option<Instant>,
    size: usize,
    prev: usize,
    next: usize,
}

impl Node {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Index 0 is the MRU sentinel, index 1 the LRU sentinel; real nodes live
/// in the slots above, reused through a free list.
struct LruInner {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    memory_bytes: usize,
    config: CacheConfig,
    stats: CacheStats,
}

const MRU: usize = 0;
const LRU: usize = 1;

impl LruInner {
    fn new(config: CacheConfig) -> Self {
        let sentinel = |prev: usize, next: usize| {
            Some(Node {
                key: String::new(),
                value: Value::Null,
                expires_at: None,
                size: 0,
                prev,
                next,
            })
        };
        Self {
            slots: vec![sentinel(MRU, LRU), sentinel(MRU, LRU)],
            free: Vec::new(),
            index: HashMap::new(),
            memory_bytes: 0,
            config,
            stats: CacheStats::default(),
        }
    }

    fn node(&self, slot: usize) -> &Node {
        self.slots[slot].as_ref().unwrap_or_else(|| unreachable!("slot {slot} is vacant"))
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        self.slots[slot].as_mut().unwrap_or_else(|| unreachable!("slot {slot} is vacant"))
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        self.node_mut(prev).next = next;
        self.node_mut(next).prev = prev;
    }

    fn link_front(&mut self, slot: usize) {
        let first = self.node(MRU).next;
        {
            let node = self.node_mut(slot);
            node.prev = MRU;
            node.next = first;
        }
        self.node_mut(MRU).next = slot;
        self.node_mut(first).prev = slot;
    }

    fn touch(&mut self, slot: usize) {
        self.unlink(slot);
        self.link_front(slot);
    }

    fn allocate(&mut self, node: Node) -> usize {
        if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(node);
            slot
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    /// Remove a node entirely, releasing its slot and accounting.
    fn remove_slot(&mut self, slot: usize) -> Node {
        self.unlink(slot);
        let node = self.slots[slot]
            .take()
            .unwrap_or_else(|| unreachable!("slot {slot} is vacant"));
        self.index.remove(&node.key);
        self.memory_bytes -= node.size;
        self.free.push(slot);
        node
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Instant> {
        let ttl = ttl.or(self.config.default_ttl)?;
        if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        }
    }

    fn evict_to_bounds(&mut self) {
        let mut evicted = 0;
        while (self.index.len() > self.config.max_size
            || self.memory_bytes > self.config.max_memory_bytes)
            && evicted < MAX_EVICTIONS_PER_SET
        {
            let coldest = self.node(LRU).prev;
            if coldest == MRU {
                break;
            }
            let node = self.remove_slot(coldest);
            trace!(key = %node.key, "evicted");
            self.stats.evictions += 1;
            evicted += 1;
        }
    }

    fn get(&mut self, key: &str) -> Option<Value> {
        let Some(&slot) = self.index.get(key) else {
            self.stats.misses += 1;
            return None;
        };
        if self.node(slot).is_expired(Instant::now()) {
            self.remove_slot(slot);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }
        self.touch(slot);
        self.stats.hits += 1;
        Some(self.node(slot).value.clone())
    }

    /// Presence check without recency or hit/miss side effects. Expired
    /// entries are still removed and counted.
    fn contains(&mut self, key: &str) -> bool {
        let Some(&slot) = self.index.get(key) else {
            return false;
        };
        if self.node(slot).is_expired(Instant::now()) {
            self.remove_slot(slot);
            self.stats.expirations += 1;
            return false;
        }
        true
    }

    /// Read without any side effects at all; used for watcher old-value
    /// snapshots and transaction backups.
    fn peek(&self, key: &str) -> Option<Value> {
        let &slot = self.index.get(key)?;
        let node = self.node(slot);
        if node.is_expired(Instant::now()) {
            return None;
        }
        Some(node.value.clone())
    }

    fn set(&mut self, key: &str, value: Value, ttl: Option<Duration>) {
        let size = estimate_size(&value) + key.len() + ENTRY_OVERHEAD;
        let expires_at = self.effective_ttl(ttl);
        if let Some(&slot) = self.index.get(key) {
            let node = self.node_mut(slot);
            let old_size = node.size;
            node.value = value;
            node.size = size;
            node.expires_at = expires_at;
            self.memory_bytes = self.memory_bytes - old_size + size;
            self.touch(slot);
        } else {
            let slot = self.allocate(Node {
                key: key.to_string(),
                value,
                expires_at,
                size,
                prev: MRU,
                next: LRU,
            });
            self.index.insert(key.to_string(), slot);
            self.memory_bytes += size;
            self.link_front(slot);
        }
        self.evict_to_bounds();
    }

    fn delete(&mut self, key: &str) -> bool {
        if let Some(&slot) = self.index.get(key) {
            self.remove_slot(slot);
            true
        } else {
            false
        }
    }

    fn clear(&mut self) {
        let config = self.config.clone();
        let stats = CacheStats {
            size: 0,
            memory_bytes: 0,
            ..self.stats.clone()
        };
        *self = Self::new(config);
        self.stats = stats;
    }

    /// Keys of expired nodes, coldest first, for the sweep.
    fn expired_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys = Vec::new();
        let mut slot = self.node(LRU).prev;
        while slot != MRU {
            let node = self.node(slot);
            if node.is_expired(now) {
                keys.push(node.key.clone());
            }
            slot = node.prev;
        }
        keys
    }
}

/// Shared handle to the LRU+TTL cache.
pub struct Cache {
    inner: Arc<Mutex<LruInner>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// Create a cache; when a default TTL is configured a background sweep
    /// task starts alongside.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let sweep_interval = config.default_ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| {
            Duration::from_millis((ttl.as_millis() as u64 / 10).clamp(1000, 60_000))
        });
        let inner = Arc::new(Mutex::new(LruInner::new(config)));
        let sweeper = sweep_interval.map(|interval| {
            // The task holds only a weak handle so a dropped cache shuts
            // the sweep down on its next tick.
            let weak = Arc::downgrade(&inner);
            tokio::spawn(sweep_loop(weak, interval))
        });
        Self {
            inner,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Lookup with recency update; expired entries are purged and counted.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key)
    }

    /// Presence check without touching recency or hit/miss counters.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains(key)
    }

    /// Side-effect-free read of the current cached value.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.inner.lock().peek(key)
    }

    /// Upsert. `ttl` overrides the cache default for this entry; a zero
    /// TTL disables expiry for it.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        self.inner.lock().set(key, value, ttl);
    }

    /// Remove an entry. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().delete(key)
    }

    /// Drop all entries; lookup counters survive.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Current statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.index.len(),
            memory_bytes: inner.memory_bytes,
            ..inner.stats.clone()
        }
    }

    /// Reset hit/miss/eviction/expiration counters.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.stats = CacheStats::default();
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the structure and stop the sweep task.
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.inner.lock().clear();
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

async fn sweep_loop(weak: Weak<Mutex<LruInner>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        // Snapshot candidates under the lock, then purge in small chunks,
        // re-checking expiry each time so a refreshed entry survives.
        let candidates = inner.lock().expired_keys();
        if candidates.is_empty() {
            continue;
        }
        let mut purged = 0u64;
        for chunk in candidates.chunks(SWEEP_CHUNK) {
            {
                let mut guard = inner.lock();
                let now = Instant::now();
                for key in chunk {
                    if let Some(&slot) = guard.index.get(key) {
                        if guard.node(slot).is_expired(now) {
                            guard.remove_slot(slot);
                            guard.stats.expirations += 1;
                            purged += 1;
                        }
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        if purged > 0 {
            debug!(purged, "sweep purged expired entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_of(max_size: usize) -> Cache {
        Cache::new(CacheConfig {
            max_size,
            ..CacheConfig::default()
        })
    }

    #[tokio::test]
    async fn lru_eviction_drops_the_coldest_key() {
        let cache = cache_of(3);
        cache.set("a", Value::from(1), None);
        cache.set("b", Value::from(2), None);
        cache.set("c", Value::from(3), None);
        // Touch "a" so "b" becomes the coldest.
        assert_eq!(cache.get("a"), Some(Value::from(1)));
        cache.set("d", Value::from(4), None);

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn set_update_moves_to_mru() {
        let cache = cache_of(2);
        cache.set("a", Value::from(1), None);
        cache.set("b", Value::from(2), None);
        cache.set("a", Value::from(10), None);
        cache.set("c", Value::from(3), None);
        // "b" was coldest after the re-set of "a".
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.get("a"), Some(Value::from(10)));
    }

    #[tokio::test]
    async fn hits_and_misses_are_counted() {
        let cache = cache_of(10);
        cache.set("a", Value::from(1), None);
        let _ = cache.get("a");
        let _ = cache.get("a");
        let _ = cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hit_rate_is_zero_without_lookups() {
        let cache = cache_of(10);
        assert_eq!(cache.stats().hit_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_removed_on_access() {
        let cache = Cache::new(CacheConfig {
            max_size: 10,
            max_memory_bytes: usize::MAX,
            default_ttl: Some(Duration::from_millis(50)),
        });
        cache.set("a", Value::from(1), None);
        tokio::time::advance(Duration::from_millis(80)).await;

        assert_eq!(cache.get("a"), None);
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_entry_ttl_overrides_the_default() {
        let cache = Cache::new(CacheConfig {
            max_size: 10,
            max_memory_bytes: usize::MAX,
            default_ttl: Some(Duration::from_millis(50)),
        });
        cache.set("long", Value::from(1), Some(Duration::from_secs(60)));
        // Zero TTL disables expiry for the entry.
        cache.set("pinned", Value::from(2), Some(Duration::ZERO));
        tokio::time::advance(Duration::from_millis(80)).await;

        assert_eq!(cache.get("long"), Some(Value::from(1)));
        assert_eq!(cache.get("pinned"), Some(Value::from(2)));
    }

    #[tokio::test]
    async fn memory_bound_forces_eviction() {
        let cache = Cache::new(CacheConfig {
            max_size: 1000,
            max_memory_bytes: 4096,
            default_ttl: None,
        });
        for i in 0..64 {
            cache.set(&format!("k{i}"), Value::from("x".repeat(256)), None);
        }
        let stats = cache.stats();
        assert!(stats.memory_bytes <= 4096);
        assert!(stats.evictions > 0);
        assert!(stats.size < 64);
    }

    #[tokio::test]
    async fn contains_does_not_touch_recency_or_counters() {
        let cache = cache_of(2);
        cache.set("a", Value::from(1), None);
        cache.set("b", Value::from(2), None);
        // A plain presence check on "a" must not rescue it from eviction.
        assert!(cache.contains("a"));
        cache.set("c", Value::from(3), None);
        assert!(!cache.contains("a"));
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn delete_releases_memory_accounting() {
        let cache = cache_of(10);
        cache.set("a", Value::from("payload"), None);
        let before = cache.stats().memory_bytes;
        assert!(before > 0);
        assert!(cache.delete("a"));
        assert_eq!(cache.stats().memory_bytes, 0);
        assert!(!cache.delete("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_purges_expired_entries_in_the_background() {
        let cache = Cache::new(CacheConfig {
            max_size: 100,
            max_memory_bytes: usize::MAX,
            default_ttl: Some(Duration::from_secs(1)),
        });
        for i in 0..20 {
            cache.set(&format!("k{i}"), Value::from(i), None);
        }
        // Sweep interval clamps to 1s; after two ticks everything is gone
        // without any access.
        tokio::time::advance(Duration::from_millis(2500)).await;
        tokio::task::yield_now().await;
        let stats = cache.stats();
        assert_eq!(stats.size, 0, "sweep did not run");
        assert_eq!(stats.expirations, 20);
    }

    #[tokio::test]
    async fn slots_are_reused_after_delete() {
        let cache = cache_of(100);
        for round in 0..10 {
            for i in 0..10 {
                cache.set(&format!("r{round}-k{i}"), Value::from(i), None);
            }
            for i in 0..10 {
                cache.delete(&format!("r{round}-k{i}"));
            }
        }
        assert_eq!(cache.len(), 0);
    }
}

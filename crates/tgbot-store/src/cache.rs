//! Hot cache for user properties, built on [`moka`].
//!
//! Keys are fixed-width SHA-256 digests of `(user_id, property)`, so an
//! untrusted property name can neither blow up key size nor collide with
//! another user's entry. Values larger than a configurable ceiling are never
//! cached; they are always read from the database.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use ring::digest::{SHA256, digest};
use tracing::debug;

use crate::property::PropertyValue;

// ── cache key ────────────────────────────────────────────────────────

/// Digest of `(user_id, property)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn new(user_id: &str, property: &str) -> Self {
        let mut material = Vec::with_capacity(user_id.len() + property.len() + 1);
        material.extend_from_slice(user_id.as_bytes());
        // NUL cannot appear in either part, so ("a_b", "c") != ("a", "b_c").
        material.push(0);
        material.extend_from_slice(property.as_bytes());

        let mut key = [0_u8; 32];
        key.copy_from_slice(digest(&SHA256, &material).as_ref());
        Self(key)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey(")?;
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
}

impl CacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Total cache hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total cache misses since creation. Every miss is a database read.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Values refused because they exceeded the size ceiling.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Total lookups (hits + misses).
    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate as a value between 0.0 and 1.0 (returns 0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rejected={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.rejected(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── smart cache ──────────────────────────────────────────────────────

/// Bounded LRU cache of property values with a per-entry size ceiling.
///
/// Cloning is cheap and clones share the same entries and stats. The cache
/// synchronises internally and never touches the database lock.
#[derive(Clone)]
pub struct SmartCache {
    inner: Cache<CacheKey, PropertyValue>,
    max_value_size: usize,
    stats: Arc<CacheStats>,
}

impl SmartCache {
    /// Create a cache holding at most `max_size` entries, each no larger
    /// than `max_value_size` bytes.
    pub fn new(max_size: u64, max_value_size: usize) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_size)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        debug!(max_size, max_value_size, "property cache created");

        Self {
            inner,
            max_value_size,
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Look up a cached value. Returns `None` on miss.
    pub fn get(&self, key: &CacheKey) -> Option<PropertyValue> {
        match self.inner.get(key) {
            Some(value) => {
                self.stats.record_hit();
                Some(value)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Cache `value`, or drop any existing entry if `value` is too large.
    pub fn set(&self, key: CacheKey, value: PropertyValue) {
        let size = value.approx_size();
        if size > self.max_value_size {
            debug!(?key, size, max = self.max_value_size, "value too large to cache");
            self.stats.record_rejected();
            self.inner.invalidate(&key);
            return;
        }
        self.inner.insert(key, value);
    }

    /// Remove a specific entry.
    pub fn delete(&self, key: &CacheKey) {
        self.inner.invalidate(key);
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.inner.invalidate_all();
        debug!("property cache cleared");
    }

    /// Whether `key` is currently cached. Does not touch recency or stats.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.contains_key(key)
    }

    /// Current number of entries. Eviction bookkeeping is applied lazily;
    /// call [`SmartCache::run_pending_tasks`] first for an exact figure.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Apply pending eviction and recency bookkeeping.
    pub fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks();
    }

    /// Hit/miss counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Largest value size that will be cached.
    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }
}

// ── tests ────────────────────────────────────────────────────────────

//! Result cache: process-wide memoization of operation results.
//!
//! Keyed by `(operation key, argument fingerprint)`. Each entry carries an
//! absolute expiry and the name of the module that produced it, so entries
//! can be dropped together with their module when the cache-dependency
//! policy asks for it. Values are fully materialized, so serving a hit never
//! needs the producing module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use capgate_core::{Fingerprint, OperationKey, Value};
use dashmap::DashMap;
use serde::Serialize;

/// Identifies one cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub operation: OperationKey,
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    #[must_use]
    pub fn new(operation: OperationKey, fingerprint: Fingerprint) -> Self {
        Self {
            operation,
            fingerprint,
        }
    }
}

/// A cached result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: u64,
    /// Live while `now < expires_at`.
    pub expires_at: u64,
    pub owning_module: Option<&'static str>,
    pub size_bytes: usize,
    pub hits: u64,
}

impl CacheEntry {
    #[must_use]
    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Counters exposed through diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub estimated_bytes: usize,
    pub hit_ratio: f64,
}

/// Bounded, expiring result store.
pub struct ResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl ResultCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Returns the live value for `key`, counting a hit or a miss. An expired
    /// entry found here is removed.
    pub fn get(&self, key: &CacheKey, now: u64) -> Option<Value> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_live(now) {
                entry.hits += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        if self
            .entries
            .remove_if(key, |_, entry| !entry.is_live(now))
            .is_some()
        {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Like [`get`](Self::get) but leaves counters and expired entries alone.
    #[must_use]
    pub fn peek(&self, key: &CacheKey, now: u64) -> Option<Value> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Stores `value` for `ttl`. A zero TTL stores nothing.
    ///
    /// When the cache is full, expired entries are purged first; if it is
    /// still full, the entry closest to expiry is evicted.
    pub fn set(
        &self,
        key: CacheKey,
        value: Value,
        ttl: Duration,
        owning_module: Option<&'static str>,
        now: u64,
    ) {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if ttl_ms == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.purge_expired(now);
            if self.entries.len() >= self.max_entries {
                self.evict_soonest_expiring();
            }
        }
        let size_bytes = value.estimated_size();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now.saturating_add(ttl_ms),
                owning_module,
                size_bytes,
                hits: 0,
            },
        );
    }

    /// Drops one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drops every entry owned by `module`. Returns how many were dropped.
    pub fn invalidate_module(&self, module: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.owning_module != Some(module));
        let dropped = before.saturating_sub(self.entries.len());
        self.invalidations
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    /// Number of live entries owned by `module`.
    #[must_use]
    pub fn live_entries_for(&self, module: &str, now: u64) -> usize {
        self.entries
            .iter()
            .filter(|e| e.owning_module == Some(module) && e.is_live(now))
            .count()
    }

    /// Latest expiry among live entries owned by `module`.
    #[must_use]
    pub fn latest_expiry_for(&self, module: &str, now: u64) -> Option<u64> {
        self.entries
            .iter()
            .filter(|e| e.owning_module == Some(module) && e.is_live(now))
            .map(|e| e.expires_at)
            .max()
    }

    /// Removes all expired entries. Returns how many were removed.
    pub fn purge_expired(&self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let purged = before.saturating_sub(self.entries.len());
        self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    fn evict_soonest_expiring(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %key.operation, fingerprint = %key.fingerprint.short(), "cache entry evicted");
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the estimated sizes of all stored values.
    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_ratio = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        CacheStats {
            entries: self.entries.len(),
            hits,
            misses,
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            estimated_bytes: self.estimated_bytes(),
            hit_ratio,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

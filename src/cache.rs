//! DNS answer cache with TTL-based expiration.
//!
//! The cache is the only state shared between the listener and the sweeper,
//! so every access goes through one `RwLock`. Entries are immutable once
//! built and handed out as `Arc`s: `put` swaps the whole entry, readers never
//! see a half-written one.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use crate::dns::{CachedRecord, DnsQuery};

/// Cache key: normalized domain name and query type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub domain: String,
    pub qtype: u16,
}

impl CacheKey {
    /// Create a key, lowercasing the domain and dropping a trailing dot.
    pub fn new(domain: &str, qtype: u16) -> Self {
        let trimmed = domain.trim_end_matches('.');
        let domain = if trimmed.is_empty() {
            ".".to_string()
        } else {
            trimmed.to_ascii_lowercase()
        };
        Self { domain, qtype }
    }
}

impl From<&DnsQuery> for CacheKey {
    fn from(query: &DnsQuery) -> Self {
        Self::new(&query.domain, query.qtype)
    }
}

/// A cached answer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    records: Vec<CachedRecord>,
    ttl: u32,
    expires_at: SystemTime,
}

impl CacheEntry {
    /// Build an entry inserted at `inserted_at` with `ttl` seconds to live.
    ///
    /// Returns `None` for an empty record set, which is never cached.
    pub fn new(records: Vec<CachedRecord>, ttl: u32, inserted_at: SystemTime) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        Some(Self {
            records,
            ttl,
            expires_at: inserted_at + Duration::from_secs(u64::from(ttl)),
        })
    }

    pub fn records(&self) -> &[CachedRecord] {
        &self.records
    }

    /// TTL in seconds as reported by upstream.
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }
}

/// Owned copy of the whole cache, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub entries: Vec<(CacheKey, CacheEntry)>,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// TTL-based DNS cache.
pub struct DnsCache {
    entries: RwLock<FxHashMap<CacheKey, Arc<CacheEntry>>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Look up an entry regardless of freshness.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.read().get(key).cloned()
    }

    /// Store an entry, replacing any previous one for `key`.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) {
        self.write().insert(key, Arc::new(entry));
    }

    /// Remove an entry. Returns whether one was present.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.write().remove(key).is_some()
    }

    /// Remove `key` only if its entry is stale at `now`.
    ///
    /// An entry refreshed after it was found stale is kept.
    pub fn remove_if_stale(&self, key: &CacheKey, now: SystemTime) -> bool {
        let mut entries = self.write();
        let stale = entries
            .get(key)
            .is_some_and(|entry| !entry.is_fresh_at(now));
        if stale {
            entries.remove(key);
        }
        stale
    }

    /// Keys whose entries are stale at `now`.
    pub fn expired_keys(&self, now: SystemTime) -> Vec<CacheKey> {
        self.read()
            .iter()
            .filter(|(_, entry)| !entry.is_fresh_at(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Copy out every entry, sorted by key.
    pub fn snapshot(&self) -> CacheSnapshot {
        let mut entries: Vec<(CacheKey, CacheEntry)> = self
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), CacheEntry::clone(entry)))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        CacheSnapshot { entries }
    }

    /// Replace the whole cache with the snapshot's contents.
    ///
    /// Entries without records are skipped. Returns the number restored.
    pub fn restore(&self, snapshot: CacheSnapshot) -> usize {
        let entries: FxHashMap<CacheKey, Arc<CacheEntry>> = snapshot
            .entries
            .into_iter()
            .filter(|(_, entry)| !entry.records.is_empty())
            .map(|(key, entry)| (key, Arc::new(entry)))
            .collect();
        let restored = entries.len();
        *self.write() = entries;
        restored
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panic while holding the lock cannot leave a half-built entry behind,
    // so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<CacheKey, Arc<CacheEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<CacheKey, Arc<CacheEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

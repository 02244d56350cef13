//! In-memory cache store: hot item bytes under the size threshold,
//! plus the in-flight ingest locks.
//!
//! Locks are owner-tagged: only the task that acquired a lock can
//! release it, and an expired lock is claimable by anyone. TTL expiry is
//! the crash-recovery path for a worker that died mid-ingest.

use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};

pub trait CacheStore: Send + Sync {
    fn put(&self, key: &str, bytes: Bytes, ttl: Duration);
    fn get(&self, key: &str) -> Option<Bytes>;
    fn delete(&self, key: &str);
    /// Atomic set-if-absent with an owner tag. Returns `true` when the
    /// lock was acquired.
    fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> bool;
    /// Release a lock; only the owner may release. Returns `true` when
    /// the lock was removed.
    fn unlock(&self, key: &str, owner: &str) -> bool;
    fn purge_expired(&self) -> usize;
}

enum Entry {
    Value(Bytes),
    Lock { owner: String },
}

struct CacheEntry {
    entry: Entry,
    expires_at: Instant,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Default)]
pub struct MemCacheStore {
    entries: DashMap<String, CacheEntry>,
}

impl MemCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemCacheStore {
    fn put(&self, key: &str, bytes: Bytes, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                entry: Entry::Value(bytes),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        let entry = self.entries.get(key)?;
        if entry.expired() {
            return None;
        }
        match &entry.entry {
            Entry::Value(bytes) => Some(bytes.clone()),
            Entry::Lock { .. } => None,
        }
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        use dashmap::mapref::entry::Entry as MapEntry;
        // The entry API makes check-and-claim atomic within the process.
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().expired() {
                    occupied.insert(CacheEntry {
                        entry: Entry::Lock {
                            owner: owner.to_string(),
                        },
                        expires_at: Instant::now() + ttl,
                    });
                    true
                } else {
                    false
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    entry: Entry::Lock {
                        owner: owner.to_string(),
                    },
                    expires_at: Instant::now() + ttl,
                });
                true
            }
        }
    }

    fn unlock(&self, key: &str, owner: &str) -> bool {
        self.entries
            .remove_if(key, |_, v| {
                matches!(&v.entry, Entry::Lock { owner: held } if held == owner)
            })
            .is_some()
    }

    fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.expired());
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_roundtrip_and_expiry() {
        let cache = MemCacheStore::new();
        cache.put("k", Bytes::from_static(b"v"), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"v")));

        cache.put("gone", Bytes::from_static(b"v"), Duration::from_millis(0));
        assert_eq!(cache.get("gone"), None);
        assert!(cache.purge_expired() >= 1);
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let cache = MemCacheStore::new();
        assert!(cache.try_lock("inflight:a", "owner-1", Duration::from_secs(60)));
        assert!(!cache.try_lock("inflight:a", "owner-2", Duration::from_secs(60)));

        // Only the owner can release.
        assert!(!cache.unlock("inflight:a", "owner-2"));
        assert!(cache.unlock("inflight:a", "owner-1"));
        assert!(cache.try_lock("inflight:a", "owner-2", Duration::from_secs(60)));
    }

    #[test]
    fn expired_lock_is_claimable() {
        let cache = MemCacheStore::new();
        assert!(cache.try_lock("inflight:b", "owner-1", Duration::from_millis(0)));
        assert!(cache.try_lock("inflight:b", "owner-2", Duration::from_secs(60)));
    }

    #[test]
    fn lock_keys_do_not_read_as_values() {
        let cache = MemCacheStore::new();
        assert!(cache.try_lock("k", "o", Duration::from_secs(60)));
        assert_eq!(cache.get("k"), None);
    }
}

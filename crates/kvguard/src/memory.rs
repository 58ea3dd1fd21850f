//! In-process fallback store.
//!
//! Holds string values and member sets under a byte budget. Expiry is
//! checked lazily on every read and by the periodic sweep.
//!
//! Entries are either pinned or evictable. Pinned entries hold writes the
//! primary has not seen yet and are never evicted; a pinned write that does
//! not fit fails. Evictable entries are warm copies of primary data and give
//! way, oldest first, to anything that needs the room.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use tokio::sync::RwLock;

use kvguard_core::cache::{pattern_matches, CacheEntry};
use kvguard_core::{KvError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredValue {
    Bytes(Vec<u8>),
    Members(BTreeSet<String>),
}

impl StoredValue {
    fn size(&self) -> usize {
        match self {
            StoredValue::Bytes(bytes) => bytes.len(),
            StoredValue::Members(members) => members.iter().map(String::len).sum(),
        }
    }
}

fn entry_size(key: &str, value: &StoredValue) -> usize {
    key.len() + value.size()
}

/// How long an entry may stay when memory runs short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Only removed by expiry, deletes or [`MemoryStore::release_all`].
    Pinned,
    /// May be evicted to make room for other writes.
    Evictable,
}

/// Byte usage of the fallback store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_bytes: usize,
    /// Part of `used_bytes` held by evictable copies.
    pub evictable_bytes: usize,
    pub max_bytes: usize,
    pub keys: usize,
}

impl MemoryUsage {
    /// Bytes that cannot be reclaimed by eviction.
    pub fn pinned_bytes(&self) -> usize {
        self.used_bytes - self.evictable_bytes
    }
}

struct Slot {
    entry: CacheEntry<StoredValue>,
    /// Position in the eviction order; `None` when pinned.
    evict_seq: Option<u64>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    used_bytes: usize,
    evictable_bytes: usize,
    /// Evictable keys, oldest first.
    evict_order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Inner {
    /// Returns the live entry for `key`, evicting it first if it expired.
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Utc::now();
        if self
            .entries
            .get(key)
            .is_some_and(|slot| slot.entry.is_expired_at(now))
        {
            self.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.entries.remove(key)?;
        let size = entry_size(key, &slot.entry.data);
        self.used_bytes -= size;
        if let Some(seq) = slot.evict_seq {
            self.evict_order.remove(&seq);
            self.evictable_bytes -= size;
        }
        Some(slot)
    }

    /// Inserts `entry`, evicting older evictable entries when short of room.
    ///
    /// Nothing is evicted when the write cannot fit even after eviction.
    fn insert(
        &mut self,
        key: &str,
        entry: CacheEntry<StoredValue>,
        retention: Retention,
        max_bytes: usize,
    ) -> Result<()> {
        let requested = entry_size(key, &entry.data);
        let (replaced, replaced_evictable) = match self.entries.get(key) {
            Some(old) => {
                let size = entry_size(key, &old.entry.data);
                (size, if old.evict_seq.is_some() { size } else { 0 })
            }
            None => (0, 0),
        };
        let available = max_bytes.saturating_sub(self.used_bytes - replaced);
        if requested > available {
            let reclaimable = self.evictable_bytes - replaced_evictable;
            if requested > available + reclaimable {
                return Err(KvError::Capacity {
                    requested,
                    available,
                });
            }
            self.evict_for(key, requested, max_bytes, replaced);
        }

        self.remove(key);
        self.used_bytes += requested;
        let evict_seq = match retention {
            Retention::Pinned => None,
            Retention::Evictable => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.evict_order.insert(seq, key.to_string());
                self.evictable_bytes += requested;
                Some(seq)
            }
        };
        self.entries
            .insert(key.to_string(), Slot { entry, evict_seq });
        Ok(())
    }

    /// Evicts the oldest evictable entries other than `key` until
    /// `requested` bytes fit.
    fn evict_for(&mut self, key: &str, requested: usize, max_bytes: usize, replaced: usize) {
        let victims: Vec<String> = self
            .evict_order
            .values()
            .filter(|victim| victim.as_str() != key)
            .cloned()
            .collect();
        for victim in victims {
            if max_bytes.saturating_sub(self.used_bytes - replaced) >= requested {
                break;
            }
            self.remove(&victim);
        }
    }

    fn is_pinned(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|slot| slot.evict_seq.is_none())
    }
}

/// Bounded in-memory key-value store used while the primary is down.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    max_bytes: usize,
}

impl MemoryStore {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_bytes,
        }
    }

    /// Returns the live string value under `key`.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.write().await;
        match &inner.live(key)?.entry.data {
            StoredValue::Bytes(bytes) => Some(bytes.clone()),
            StoredValue::Members(_) => None,
        }
    }

    /// Stores a pinned `value`; a TTL of `None` or zero never expires.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Capacity` if the write does not fit even after
    /// evicting every evictable entry.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: Option<u64>) -> Result<()> {
        self.set_with(key, value, ttl_seconds, Retention::Pinned)
            .await
    }

    /// Stores `value` with the given retention.
    ///
    /// # Errors
    ///
    /// Same as [`set`](Self::set).
    pub async fn set_with(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
        retention: Retention,
    ) -> Result<()> {
        let ttl = ttl_seconds.filter(|ttl| *ttl > 0);
        let entry = CacheEntry::new(StoredValue::Bytes(value), ttl, Utc::now());
        self.inner
            .write()
            .await
            .insert(key, entry, retention, self.max_bytes)
    }

    /// Removes `key`, returning whether a live value was there.
    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        let live = inner.live(key).is_some();
        inner.remove(key);
        live
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.inner.write().await.live(key).is_some()
    }

    /// Adds `member` to the pinned set under `key`, returning whether it was new.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Capacity` if the grown set does not fit, or
    /// `KvError::OperationFailed` if `key` holds a string value.
    pub async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.set_add_with(key, member, Retention::Pinned).await
    }

    /// Adds `member` to the set under `key`. A pinned set stays pinned.
    ///
    /// # Errors
    ///
    /// Same as [`set_add`](Self::set_add).
    pub async fn set_add_with(&self, key: &str, member: &str, retention: Retention) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let mut members = match inner.live(key).map(|slot| &slot.entry.data) {
            Some(StoredValue::Members(members)) => members.clone(),
            Some(StoredValue::Bytes(_)) => {
                return Err(KvError::OperationFailed(format!(
                    "{} holds a string value",
                    key
                )))
            }
            None => BTreeSet::new(),
        };
        if !members.insert(member.to_string()) {
            return Ok(false);
        }
        let retention = if inner.is_pinned(key) {
            Retention::Pinned
        } else {
            retention
        };
        let entry = CacheEntry::new(StoredValue::Members(members), None, Utc::now());
        inner.insert(key, entry, retention, self.max_bytes)?;
        Ok(true)
    }

    /// Removes `member` from the set under `key`, returning whether it was there.
    pub async fn set_remove(&self, key: &str, member: &str) -> bool {
        let mut inner = self.inner.write().await;
        let (removed, now_empty, evictable) = match inner.live(key) {
            Some(Slot {
                entry,
                evict_seq,
            }) => match &mut entry.data {
                StoredValue::Members(members) => {
                    let removed = members.remove(member);
                    (removed, members.is_empty(), evict_seq.is_some())
                }
                StoredValue::Bytes(_) => (false, false, false),
            },
            None => (false, false, false),
        };
        if removed {
            inner.used_bytes -= member.len();
            if evictable {
                inner.evictable_bytes -= member.len();
            }
        }
        if now_empty {
            inner.remove(key);
        }
        removed
    }

    pub async fn set_members(&self, key: &str) -> Vec<String> {
        let mut inner = self.inner.write().await;
        match inner.live(key).map(|slot| &slot.entry.data) {
            Some(StoredValue::Members(members)) => members.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Live keys matching a glob pattern, sorted.
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, slot)| !slot.entry.is_expired_at(now) && pattern_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Makes every pinned entry evictable, once the primary holds them all.
    pub async fn release_all(&self) {
        let mut inner = self.inner.write().await;
        let Inner {
            entries,
            evictable_bytes,
            evict_order,
            next_seq,
            ..
        } = &mut *inner;
        let mut pinned: Vec<(&String, &mut Slot)> = entries
            .iter_mut()
            .filter(|(_, slot)| slot.evict_seq.is_none())
            .collect();
        pinned.sort_by_key(|(_, slot)| slot.entry.written_at);
        for (key, slot) in pinned {
            let seq = *next_seq;
            *next_seq += 1;
            evict_order.insert(seq, key.clone());
            *evictable_bytes += entry_size(key, &slot.entry.data);
            slot.evict_seq = Some(seq);
        }
    }

    /// Removes every expired entry, returning how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub async fn clear(&self) {
        *self.inner.write().await = Inner::default();
    }

    pub async fn usage(&self) -> MemoryUsage {
        let inner = self.inner.read().await;
        MemoryUsage {
            used_bytes: inner.used_bytes,
            evictable_bytes: inner.evictable_bytes,
            max_bytes: self.max_bytes,
            keys: inner.entries.len(),
        }
    }
}

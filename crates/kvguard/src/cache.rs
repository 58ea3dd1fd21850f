//! Typed key-value cache over the tiered store.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;

use kvguard_core::cache::{decode, encode, is_pattern, namespaced_key, CacheOptions, CacheStats};
use kvguard_core::config::CacheConfig;
use kvguard_core::Result;

use crate::tiered::TieredStore;

pub struct CacheStore {
    tiered: Arc<TieredStore>,
    config: CacheConfig,
    key_prefix: String,
    stats: Mutex<CacheStats>,
}

impl CacheStore {
    pub fn new(tiered: Arc<TieredStore>, config: CacheConfig, key_prefix: impl Into<String>) -> Self {
        Self {
            tiered,
            config,
            key_prefix: key_prefix.into(),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Reads a value, returning `None` on a miss or any failure.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, opts: &CacheOptions) -> Option<T> {
        match self.try_get(key, opts).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Cache read failed");
                None
            }
        }
    }

    /// Reads a value.
    ///
    /// A stored payload that no longer decodes into `T` counts as a miss and
    /// the key is deleted.
    ///
    /// # Errors
    ///
    /// Returns the primary's error when `fallback_to_memory` is off and the
    /// primary cannot answer.
    pub async fn try_get<T: DeserializeOwned>(
        &self,
        key: &str,
        opts: &CacheOptions,
    ) -> Result<Option<T>> {
        let full_key = self.full_key(key, opts);
        let bytes = match self.tiered.get(&full_key, opts.fallback_to_memory).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.record(|stats| stats.errors += 1);
                return Err(err);
            }
        };

        let Some(bytes) = bytes else {
            self.record(|stats| stats.misses += 1);
            return Ok(None);
        };

        match decode::<T>(&bytes) {
            Ok(value) => {
                self.record(|stats| stats.hits += 1);
                Ok(Some(value))
            }
            Err(err) => {
                tracing::warn!(key = %full_key, error = %err, "Dropping corrupt cache entry");
                self.record(|stats| {
                    stats.errors += 1;
                    stats.misses += 1;
                });
                if let Err(err) = self.tiered.delete(&full_key, opts.fallback_to_memory).await {
                    tracing::debug!(key = %full_key, error = %err, "Failed to delete corrupt entry");
                }
                Ok(None)
            }
        }
    }

    /// Stores a value, returning whether either backend accepted it.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, opts: &CacheOptions) -> bool {
        match self.try_set(key, value, opts).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Cache write failed");
                false
            }
        }
    }

    /// Stores a value.
    ///
    /// # Errors
    ///
    /// - `KvError::Serialization` when the value cannot be encoded
    /// - `KvError::Capacity` when only memory could take the write and it is full
    /// - the primary's error when `fallback_to_memory` is off
    pub async fn try_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        opts: &CacheOptions,
    ) -> Result<()> {
        let full_key = self.full_key(key, opts);
        let result = match encode(value, opts.compression, self.config.compression_threshold) {
            Ok(encoded) => {
                self.tiered
                    .set(&full_key, encoded.bytes, self.ttl(opts), opts.fallback_to_memory)
                    .await
            }
            Err(err) => Err(err),
        };
        match &result {
            Ok(()) => self.record(|stats| stats.sets += 1),
            Err(_) => self.record(|stats| stats.errors += 1),
        }
        result
    }

    /// Deletes a key, returning whether it existed.
    pub async fn delete(&self, key: &str, opts: &CacheOptions) -> bool {
        let full_key = self.full_key(key, opts);
        match self.tiered.delete(&full_key, opts.fallback_to_memory).await {
            Ok(existed) => {
                self.record(|stats| stats.deletes += 1);
                existed
            }
            Err(err) => {
                tracing::warn!(key = %full_key, error = %err, "Cache delete failed");
                self.record(|stats| stats.errors += 1);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str, opts: &CacheOptions) -> bool {
        let full_key = self.full_key(key, opts);
        self.tiered
            .exists(&full_key, opts.fallback_to_memory)
            .await
            .unwrap_or(false)
    }

    /// Cache-aside read: returns the cached value or computes, stores and
    /// returns a fresh one. A failed store does not fail the call.
    ///
    /// # Errors
    ///
    /// Returns the factory's error; nothing is cached in that case.
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        opts: &CacheOptions,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key, opts).await {
            return Ok(value);
        }
        let value = factory().await?;
        self.set(key, &value, opts).await;
        Ok(value)
    }

    /// Deletes every key matching a glob pattern on both backends.
    ///
    /// Returns the number of keys deleted.
    pub async fn delete_pattern(&self, pattern: &str, opts: &CacheOptions) -> usize {
        let full_pattern = self.full_key(pattern, opts);
        if !is_pattern(&full_pattern) {
            return usize::from(self.delete(pattern, opts).await);
        }

        let keys = self
            .tiered
            .keys(&full_pattern, opts.fallback_to_memory)
            .await;
        let mut deleted = 0;
        for key in &keys {
            match self.tiered.delete(key, opts.fallback_to_memory).await {
                Ok(_) => deleted += 1,
                Err(err) => tracing::debug!(key = %key, error = %err, "Pattern delete failed"),
            }
        }
        self.record(|stats| stats.deletes += deleted as u64);
        tracing::debug!(pattern = %full_pattern, deleted, "Deleted keys by pattern");
        deleted
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset_stats(&self) {
        self.record(|stats| *stats = CacheStats::default());
    }

    fn full_key(&self, key: &str, opts: &CacheOptions) -> String {
        let prefix = opts.key_prefix.as_deref().unwrap_or(&self.key_prefix);
        namespaced_key(prefix, key)
    }

    fn ttl(&self, opts: &CacheOptions) -> Option<u64> {
        match opts.ttl_seconds.unwrap_or(self.config.default_ttl_seconds) {
            0 => None,
            ttl => Some(ttl),
        }
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats);
    }
}

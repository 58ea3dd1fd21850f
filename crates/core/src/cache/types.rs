use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::Compression;

/// A value held by a backend together with its write time and TTL.
///
/// Expiry is always computed from `written_at`, never from the last read, so
/// an entry's lifetime cannot be extended by looking at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub written_at: DateTime<Utc>,
    /// `None` means the entry never expires.
    pub ttl_seconds: Option<u64>,
    pub compressed: bool,
}

impl<T> CacheEntry<T> {
    /// Creates an entry written at `now`.
    pub fn new(data: T, ttl_seconds: Option<u64>, now: DateTime<Utc>) -> Self {
        Self {
            data,
            written_at: now,
            ttl_seconds,
            compressed: false,
        }
    }

    /// Marks the entry as holding a compressed payload.
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Returns the instant after which the entry is no longer served.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl_seconds
            .map(|ttl| self.written_at + Duration::seconds(ttl.min(i64::MAX as u64) as i64))
    }

    /// Returns true if the entry has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|exp| now >= exp)
    }

    /// Seconds left before expiry, rounded up; `None` for entries without TTL.
    ///
    /// Returns `Some(0)` once the entry has expired.
    pub fn remaining_ttl_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        let expires_at = self.expires_at()?;
        let millis = (expires_at - now).num_milliseconds();
        if millis <= 0 {
            Some(0)
        } else {
            Some((millis as u64).div_ceil(1000))
        }
    }
}

/// Per-call options for the cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// TTL override; `None` uses the configured default. Zero disables expiry.
    pub ttl_seconds: Option<u64>,
    /// Key prefix override; `None` uses the configured prefix.
    pub key_prefix: Option<String>,
    pub compression: Compression,
    /// Whether the in-process fallback store may serve or hold this key.
    pub fallback_to_memory: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl_seconds: None,
            key_prefix: None,
            compression: Compression::Auto,
            fallback_to_memory: true,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the TTL in seconds.
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    /// Sets the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Sets the compression policy.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Disables the in-process fallback for this call.
    pub fn without_fallback(mut self) -> Self {
        self.fallback_to_memory = false;
        self
    }
}

/// Cache counters since start or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheStats {
    /// Total number of lookups.
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Fraction of lookups that hit, or `None` before the first lookup.
    pub fn hit_rate(&self) -> Option<f64> {
        match self.lookups() {
            0 => None,
            total => Some(self.hits as f64 / total as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let entry = CacheEntry::new("v", None, fixed_now());
        assert_eq!(entry.expires_at(), None);
        assert!(!entry.is_expired_at(fixed_now() + Duration::days(3650)));
        assert_eq!(entry.remaining_ttl_seconds(fixed_now()), None);
    }

    #[test]
    fn test_entry_expires_at_write_time_plus_ttl() {
        let entry = CacheEntry::new("v", Some(60), fixed_now());
        assert!(!entry.is_expired_at(fixed_now() + Duration::seconds(59)));
        assert!(entry.is_expired_at(fixed_now() + Duration::seconds(60)));
    }

    #[test]
    fn test_remaining_ttl_rounds_up() {
        let entry = CacheEntry::new("v", Some(10), fixed_now());
        let later = fixed_now() + Duration::milliseconds(2500);
        assert_eq!(entry.remaining_ttl_seconds(later), Some(8));
        assert_eq!(
            entry.remaining_ttl_seconds(fixed_now() + Duration::seconds(11)),
            Some(0)
        );
    }

    #[test]
    fn test_options_builder() {
        let options = CacheOptions::new()
            .with_ttl(60)
            .with_prefix("tenant-a")
            .with_compression(Compression::Never)
            .without_fallback();
        assert_eq!(options.ttl_seconds, Some(60));
        assert_eq!(options.key_prefix.as_deref(), Some("tenant-a"));
        assert_eq!(options.compression, Compression::Never);
        assert!(!options.fallback_to_memory);
    }

    #[test]
    fn test_hit_rate() {
        assert_eq!(CacheStats::default().hit_rate(), None);
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.lookups(), 4);
        assert_eq!(stats.hit_rate(), Some(0.75));
    }
}

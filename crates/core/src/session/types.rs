use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A guest or authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    /// `None` for guests.
    pub owner_id: Option<String>,
    pub is_guest: bool,
    pub attributes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// TTL the session was created with; sliding refreshes reuse it.
    pub ttl_seconds: u64,
}

impl SessionRecord {
    /// Creates a session. A missing owner makes it a guest session.
    pub fn new(
        id: SessionId,
        owner_id: Option<String>,
        attributes: Map<String, Value>,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            is_guest: owner_id.is_none(),
            owner_id,
            attributes,
            created_at: now,
            last_accessed_at: now,
            expires_at: expiry(now, ttl_seconds),
            ttl_seconds,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Slides the expiry forward: `expires_at = now + ttl`.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl_seconds: u64) {
        self.last_accessed_at = now;
        self.expires_at = expiry(now, ttl_seconds);
    }

    /// Merges `patch` into the attributes; a `null` value removes the key.
    pub fn apply_patch(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            if value.is_null() {
                self.attributes.remove(&key);
            } else {
                self.attributes.insert(key, value);
            }
        }
    }

    /// Seconds until expiry at `now`, rounded up. Zero once expired.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.expires_at - now).num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis as u64).div_ceil(1000)
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    now + Duration::seconds(ttl_seconds.min(i64::MAX as u64 / 1000) as i64)
}

/// Per-call session options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// TTL override; `None` keeps the session's own TTL (or the default on create).
    pub ttl_seconds: Option<u64>,
    /// Whether reads extend the expiry.
    pub sliding: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ttl_seconds: None,
            sliding: true,
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn without_sliding(mut self) -> Self {
        self.sliding = false;
        self
    }
}

/// Session counts across both backends, de-duplicated by session id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    pub guest: usize,
    pub authenticated: usize,
    /// Sessions found on the primary backend.
    pub primary: usize,
    /// Sessions found in the fallback store.
    pub memory: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap()
    }

    fn attrs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_guest_flag_follows_owner() {
        let guest = SessionRecord::new(SessionId::generate(), None, Map::new(), 60, fixed_now());
        assert!(guest.is_guest);
        let user = SessionRecord::new(
            SessionId::generate(),
            Some("u1".into()),
            Map::new(),
            60,
            fixed_now(),
        );
        assert!(!user.is_guest);
    }

    #[test]
    fn test_touch_slides_expiry() {
        let mut record = SessionRecord::new(SessionId::generate(), None, Map::new(), 60, fixed_now());
        let later = fixed_now() + Duration::seconds(30);
        record.touch(later, record.ttl_seconds);
        assert_eq!(record.expires_at, later + Duration::seconds(60));
        assert_eq!(record.last_accessed_at, later);
        assert!(!record.is_expired_at(fixed_now() + Duration::seconds(60)));
    }

    #[test]
    fn test_patch_merges_and_removes() {
        let mut record = SessionRecord::new(
            SessionId::new("s".into()),
            None,
            attrs(json!({"theme": "dark", "lang": "en"})),
            60,
            fixed_now(),
        );
        record.apply_patch(attrs(json!({"theme": null, "tz": "UTC"})));
        assert_eq!(Value::Object(record.attributes), json!({"lang": "en", "tz": "UTC"}));
    }

    #[test]
    fn test_remaining_seconds() {
        let record = SessionRecord::new(SessionId::generate(), None, Map::new(), 60, fixed_now());
        assert_eq!(record.remaining_seconds(fixed_now()), 60);
        assert_eq!(
            record.remaining_seconds(fixed_now() + Duration::milliseconds(500)),
            60
        );
        assert_eq!(record.remaining_seconds(fixed_now() + Duration::seconds(90)), 0);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}

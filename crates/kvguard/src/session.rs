//! Guest and authenticated sessions with sliding expiration.
//!
//! Records are JSON at `{prefix}:session:{id}`; each owner has a set at
//! `{prefix}:owner_sessions:{owner}` listing their session ids.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use kvguard_core::cache::{extract_session_id, owner_sessions_key, session_key, session_pattern};
use kvguard_core::session::{SessionId, SessionOptions, SessionRecord, SessionStats};
use kvguard_core::{KvError, Result};

use crate::tiered::TieredStore;

pub struct SessionStore {
    tiered: Arc<TieredStore>,
    key_prefix: String,
    default_ttl_seconds: u64,
}

impl SessionStore {
    pub fn new(tiered: Arc<TieredStore>, key_prefix: impl Into<String>, default_ttl_seconds: u64) -> Self {
        Self {
            tiered,
            key_prefix: key_prefix.into(),
            default_ttl_seconds,
        }
    }

    /// Starts a session; a missing owner makes it a guest session.
    pub async fn create_session(
        &self,
        owner_id: Option<&str>,
        attributes: Map<String, Value>,
        opts: &SessionOptions,
    ) -> Option<SessionId> {
        match self.try_create_session(owner_id, attributes, opts).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(owner_id = ?owner_id, error = %err, "Failed to create session");
                None
            }
        }
    }

    /// Starts a session.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Capacity` when only memory could take the record and
    /// it is full.
    pub async fn try_create_session(
        &self,
        owner_id: Option<&str>,
        attributes: Map<String, Value>,
        opts: &SessionOptions,
    ) -> Result<SessionId> {
        let ttl = opts.ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let record = SessionRecord::new(
            SessionId::generate(),
            owner_id.map(str::to_string),
            attributes,
            ttl,
            Utc::now(),
        );
        self.store(&record, ttl).await?;
        if let Some(owner) = owner_id {
            self.tiered
                .set_add(&owner_sessions_key(&self.key_prefix, owner), record.id.as_str())
                .await?;
        }
        tracing::debug!(session_id = %record.id, guest = record.is_guest, "Session created");
        Ok(record.id)
    }

    /// Loads a session. With `opts.sliding` the expiry moves to `now + ttl`
    /// and the refreshed record is written back.
    pub async fn get_session(&self, id: &SessionId, opts: &SessionOptions) -> Option<SessionRecord> {
        match self.try_get_session(id, opts).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(session_id = %id, error = %err, "Failed to read session");
                None
            }
        }
    }

    /// Loads a session.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Serialization` for a stored record that does not
    /// decode; the record is deleted.
    pub async fn try_get_session(
        &self,
        id: &SessionId,
        opts: &SessionOptions,
    ) -> Result<Option<SessionRecord>> {
        let Some(mut record) = self.load(id).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        if record.is_expired_at(now) {
            self.remove(&record).await;
            return Ok(None);
        }

        if opts.sliding {
            let ttl = opts.ttl_seconds.unwrap_or(record.ttl_seconds);
            record.touch(now, ttl);
            if let Err(err) = self.store(&record, ttl).await {
                tracing::debug!(session_id = %id, error = %err, "Failed to refresh session");
            }
        }
        Ok(Some(record))
    }

    /// Merges `patch` into the session attributes; `null` values remove keys.
    ///
    /// Returns false when the session does not exist or the write failed.
    pub async fn update_session(
        &self,
        id: &SessionId,
        patch: Map<String, Value>,
        opts: &SessionOptions,
    ) -> bool {
        let record = match self.load(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(session_id = %id, error = %err, "Failed to read session for update");
                return false;
            }
        };

        let now = Utc::now();
        if record.is_expired_at(now) {
            self.remove(&record).await;
            return false;
        }

        let mut record = record;
        record.apply_patch(patch);
        let ttl = match opts.ttl_seconds {
            Some(ttl) => {
                record.touch(now, ttl);
                ttl
            }
            None => {
                record.last_accessed_at = now;
                record.remaining_seconds(now).max(1)
            }
        };

        match self.store(&record, ttl).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(session_id = %id, error = %err, "Failed to update session");
                false
            }
        }
    }

    /// Deletes a session, returning whether it existed.
    pub async fn delete_session(&self, id: &SessionId) -> bool {
        match self.load(id).await {
            Ok(Some(record)) => {
                self.remove(&record).await;
                true
            }
            Ok(None) => false,
            Err(_) => self
                .tiered
                .delete(&session_key(&self.key_prefix, id), true)
                .await
                .unwrap_or(false),
        }
    }

    /// Live sessions of an owner, oldest first. Stale index entries are pruned.
    pub async fn get_sessions_by_owner(&self, owner_id: &str) -> Vec<SessionRecord> {
        let index_key = owner_sessions_key(&self.key_prefix, owner_id);
        let ids = match self.tiered.set_members(&index_key).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(owner_id, error = %err, "Failed to read owner sessions");
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            let session_id = SessionId::new(id);
            match self.load(&session_id).await {
                Ok(Some(record)) if !record.is_expired_at(now) => sessions.push(record),
                Ok(Some(record)) => self.remove(&record).await,
                Ok(None) | Err(_) => {
                    let _ = self.tiered.set_remove(&index_key, session_id.as_str()).await;
                }
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Deletes every session of an owner, returning how many were deleted.
    pub async fn invalidate_sessions_by_owner(&self, owner_id: &str) -> usize {
        let sessions = self.get_sessions_by_owner(owner_id).await;
        for record in &sessions {
            self.remove(record).await;
        }
        let _ = self
            .tiered
            .delete(&owner_sessions_key(&self.key_prefix, owner_id), true)
            .await;
        tracing::info!(owner_id, invalidated = sessions.len(), "Invalidated owner sessions");
        sessions.len()
    }

    /// Turns a guest session into an authenticated one.
    ///
    /// A new session owned by `owner_id` is created with the guest's
    /// attributes, then the guest session is deleted. Returns the new id, or
    /// `None` when the guest session is missing, already authenticated or the
    /// new session could not be stored.
    pub async fn convert_guest(&self, guest_id: &SessionId, owner_id: &str) -> Option<SessionId> {
        let guest = self
            .get_session(guest_id, &SessionOptions::new().without_sliding())
            .await?;
        if !guest.is_guest {
            tracing::debug!(session_id = %guest_id, "Session is not a guest session");
            return None;
        }

        let opts = SessionOptions::new().with_ttl(guest.ttl_seconds);
        let id = self
            .create_session(Some(owner_id), guest.attributes.clone(), &opts)
            .await?;
        self.remove(&guest).await;
        tracing::info!(guest_id = %guest_id, session_id = %id, owner_id, "Converted guest session");
        Some(id)
    }

    /// Counts live sessions on both backends, each session id once.
    pub async fn stats(&self) -> SessionStats {
        let pattern = session_pattern(&self.key_prefix);
        let primary = self.ids(self.tiered.primary_keys(&pattern).await);
        let memory = self.ids(self.tiered.memory_keys(&pattern).await);

        let mut stats = SessionStats {
            primary: primary.len(),
            memory: memory.len(),
            ..SessionStats::default()
        };

        let now = Utc::now();
        let mut seen: BTreeMap<SessionId, bool> = BTreeMap::new();
        for id in primary.union(&memory) {
            if let Ok(Some(record)) = self.load(id).await {
                if !record.is_expired_at(now) {
                    seen.insert(record.id, record.is_guest);
                }
            }
        }
        stats.total = seen.len();
        stats.guest = seen.values().filter(|guest| **guest).count();
        stats.authenticated = stats.total - stats.guest;
        stats
    }

    fn ids(&self, keys: Vec<String>) -> BTreeSet<SessionId> {
        keys.iter()
            .filter_map(|key| extract_session_id(&self.key_prefix, key))
            .collect()
    }

    async fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        let key = session_key(&self.key_prefix, id);
        let Some(bytes) = self.tiered.get(&key, true).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<SessionRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Dropping corrupt session record");
                let _ = self.tiered.delete(&key, true).await;
                Err(KvError::from(err))
            }
        }
    }

    async fn store(&self, record: &SessionRecord, ttl_seconds: u64) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        let key = session_key(&self.key_prefix, &record.id);
        self.tiered.set(&key, bytes, Some(ttl_seconds.max(1)), true).await
    }

    async fn remove(&self, record: &SessionRecord) {
        let key = session_key(&self.key_prefix, &record.id);
        if let Err(err) = self.tiered.delete(&key, true).await {
            tracing::debug!(key = %key, error = %err, "Failed to delete session");
        }
        if let Some(owner) = &record.owner_id {
            let index_key = owner_sessions_key(&self.key_prefix, owner);
            let _ = self.tiered.set_remove(&index_key, record.id.as_str()).await;
        }
    }
}

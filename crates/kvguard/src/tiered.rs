//! Primary-or-memory routing shared by the cache, session and pub/sub stores.
//!
//! While the primary is authoritative its answer is final, including a miss;
//! memory only answers when the primary read errors. Once degraded, memory is
//! read first and every write goes through the fallback queue.

use std::collections::BTreeSet;
use std::sync::Arc;

use kvguard_core::connection::{Command, Reply};
use kvguard_core::fallback::QueuedWrite;
use kvguard_core::{KvError, Result};

use crate::connection::ConnectionManager;
use crate::fallback::FallbackCoordinator;

pub struct TieredStore {
    connection: Arc<ConnectionManager>,
    fallback: Arc<FallbackCoordinator>,
}

impl TieredStore {
    pub fn new(connection: Arc<ConnectionManager>, fallback: Arc<FallbackCoordinator>) -> Self {
        Self {
            connection,
            fallback,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn fallback(&self) -> &Arc<FallbackCoordinator> {
        &self.fallback
    }

    /// Reads raw bytes.
    ///
    /// # Errors
    ///
    /// Returns the primary's error when memory is not allowed to answer.
    pub async fn get(&self, key: &str, use_memory: bool) -> Result<Option<Vec<u8>>> {
        if self.fallback.primary_authoritative() {
            return match self.connection.try_execute(Command::get(key)).await {
                Ok(Reply::Nil) => Ok(None),
                Ok(reply) => Ok(reply.into_bytes()),
                Err(err) if !use_memory => Err(err),
                Err(err) => {
                    tracing::debug!(key = %key, error = %err, "Primary read failed");
                    Ok(self.fallback.memory().get(key).await)
                }
            };
        }

        if use_memory {
            if let Some(value) = self.fallback.memory().get(key).await {
                return Ok(Some(value));
            }
            if self.fallback.has_pending_delete(key).await {
                return Ok(None);
            }
        }
        if !self.connection.is_available() || self.fallback.is_persistent() {
            return if use_memory {
                Ok(None)
            } else {
                Err(unavailable())
            };
        }
        match self.connection.try_execute(Command::get(key)).await {
            Ok(Reply::Nil) => Ok(None),
            Ok(reply) => Ok(reply.into_bytes()),
            Err(_) if use_memory => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Writes raw bytes with an optional TTL in seconds.
    ///
    /// # Errors
    ///
    /// - the primary's error when memory is not allowed to take the write
    /// - `KvError::Capacity` when memory must take the write and is full
    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
        use_memory: bool,
    ) -> Result<()> {
        let write = QueuedWrite::Set { value, ttl_seconds };
        self.write(key, write, use_memory).await.map(|_| ())
    }

    /// Deletes a key, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Same as [`set`](Self::set).
    pub async fn delete(&self, key: &str, use_memory: bool) -> Result<bool> {
        self.write(key, QueuedWrite::Delete, use_memory).await
    }

    pub async fn exists(&self, key: &str, use_memory: bool) -> Result<bool> {
        Ok(self.get(key, use_memory).await?.is_some())
    }

    /// Adds a member to the set stored at `key`.
    ///
    /// # Errors
    ///
    /// Same as [`set`](Self::set).
    pub async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let write = QueuedWrite::SetAdd {
            member: member.to_string(),
        };
        self.write(key, write, true).await.map(|_| ())
    }

    /// Removes a member from the set stored at `key`.
    ///
    /// # Errors
    ///
    /// Same as [`set`](Self::set).
    pub async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let write = QueuedWrite::SetRemove {
            member: member.to_string(),
        };
        self.write(key, write, true).await
    }

    /// Members of the set at `key`. While degraded this is the union of the
    /// memory copy and whatever the primary still holds.
    pub async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut members: BTreeSet<String> = BTreeSet::new();
        if !self.fallback.primary_authoritative() {
            members.extend(self.fallback.memory().set_members(key).await);
            if self.fallback.has_pending_delete(key).await {
                return Ok(members.into_iter().collect());
            }
        }
        if self.connection.is_available() && !self.fallback.is_persistent() {
            match self
                .connection
                .try_execute(Command::SetMembers {
                    key: key.to_string(),
                })
                .await
            {
                Ok(reply) => members.extend(reply.into_strings()),
                Err(err) if self.fallback.primary_authoritative() => {
                    tracing::debug!(key = %key, error = %err, "Primary set read failed");
                    members.extend(self.fallback.memory().set_members(key).await);
                }
                Err(_) => {}
            }
        }
        Ok(members.into_iter().collect())
    }

    /// Keys matching `pattern` on the primary and, when allowed, in memory.
    pub async fn keys(&self, pattern: &str, use_memory: bool) -> Vec<String> {
        let mut keys: BTreeSet<String> = self.primary_keys(pattern).await.into_iter().collect();
        if use_memory {
            keys.extend(self.memory_keys(pattern).await);
        }
        keys.into_iter().collect()
    }

    /// Keys matching `pattern` on the primary; empty when it is unreachable.
    pub async fn primary_keys(&self, pattern: &str) -> Vec<String> {
        if !self.connection.is_available() || self.fallback.is_persistent() {
            return Vec::new();
        }
        let command = Command::Scan {
            pattern: pattern.to_string(),
        };
        match self.connection.try_execute(command).await {
            Ok(reply) => reply.into_strings(),
            Err(err) => {
                tracing::debug!(pattern = %pattern, error = %err, "Primary scan failed");
                Vec::new()
            }
        }
    }

    pub async fn memory_keys(&self, pattern: &str) -> Vec<String> {
        self.fallback.memory().keys(pattern).await
    }

    async fn write(&self, key: &str, write: QueuedWrite, use_memory: bool) -> Result<bool> {
        let direct = self.fallback.primary_authoritative()
            || (!use_memory && self.connection.is_available() && !self.fallback.is_persistent());
        if !direct {
            if !use_memory {
                return Err(unavailable());
            }
            return self.fallback.record_write(key, write).await;
        }

        match self.connection.try_execute(primary_command(key, &write)).await {
            Ok(reply) => {
                // Whole-value writes supersede anything queued for the key;
                // member updates do not.
                if matches!(write, QueuedWrite::Set { .. } | QueuedWrite::Delete) {
                    self.fallback.forget_queued(key).await;
                }
                self.fallback.mirror_write(key, &write).await;
                Ok(reply_flag(&reply))
            }
            Err(err) if !use_memory => Err(err),
            Err(err) => {
                tracing::debug!(key = %key, error = %err, "Primary write failed, queueing");
                self.fallback.record_write(key, write).await
            }
        }
    }
}

fn primary_command(key: &str, write: &QueuedWrite) -> Command {
    let key = key.to_string();
    match write {
        QueuedWrite::Set { value, ttl_seconds } => Command::Set {
            key,
            value: value.clone(),
            ttl_seconds: *ttl_seconds,
        },
        QueuedWrite::Delete => Command::Del { keys: vec![key] },
        QueuedWrite::SetAdd { member } => Command::SetAdd {
            key,
            member: member.clone(),
        },
        QueuedWrite::SetRemove { member } => Command::SetRemove {
            key,
            member: member.clone(),
        },
    }
}

fn reply_flag(reply: &Reply) -> bool {
    match reply {
        Reply::Integer(n) => *n > 0,
        Reply::Nil => false,
        _ => true,
    }
}

fn unavailable() -> KvError {
    KvError::Connectivity("primary backend unavailable".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually_async, guard_on, start_guard, start_guard_with, test_config};

    #[tokio::test]
    async fn test_primary_write_is_mirrored() {
        let (server, guard) = start_guard().await;
        let tiered = guard.tiered();
        tiered.set("k", b"v".to_vec(), None, true).await.unwrap();
        assert_eq!(server.get_raw("k"), Some(b"v".to_vec()));
        assert_eq!(tiered.fallback().memory().get("k").await, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_primary_miss_wins_over_memory_copy() {
        let (server, first) = start_guard().await;
        let second = guard_on(&server, test_config()).await;
        first.tiered().set("k", b"v1".to_vec(), None, true).await.unwrap();
        assert!(second.tiered().delete("k", true).await.unwrap());

        assert!(!server.contains_key("k"));
        assert!(first.tiered().fallback().memory().exists("k").await);
        assert_eq!(first.tiered().get("k", true).await.unwrap(), None);
        assert!(!first.tiered().exists("k", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_answers_when_primary_read_errors() {
        let (server, guard) = start_guard().await;
        let tiered = guard.tiered();
        tiered.set("k", b"v".to_vec(), None, true).await.unwrap();

        // First failing read: the primary still looks authoritative.
        server.set_available(false);
        assert_eq!(tiered.get("k", true).await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_warm_copies_leave_room_for_outage_writes() {
        let mut config = test_config();
        config.fallback.max_memory_bytes = 200;
        let (server, guard) = start_guard_with(config).await;
        let tiered = guard.tiered();
        for i in 0..10 {
            let key = format!("key:{}", i);
            tiered.set(&key, vec![b'x'; 15], None, true).await.unwrap();
        }
        let usage = tiered.fallback().memory().usage().await;
        assert!(usage.used_bytes > 150);
        assert_eq!(usage.pinned_bytes(), 0);

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        tiered.set("new", b"y".to_vec(), None, true).await.unwrap();
        assert_eq!(tiered.get("new", true).await.unwrap(), Some(b"y".to_vec()));
        assert_eq!(tiered.fallback().queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_degraded_reads_and_writes_use_memory() {
        let (server, guard) = start_guard().await;
        let tiered = guard.tiered();
        tiered.set("k", b"v1".to_vec(), None, true).await.unwrap();

        server.set_available(false);
        tiered.set("k", b"v2".to_vec(), None, true).await.unwrap();
        assert_eq!(tiered.get("k", true).await.unwrap(), Some(b"v2".to_vec()));
        assert!(tiered.fallback().queue_len().await >= 1);
    }

    #[tokio::test]
    async fn test_memory_disallowed_surfaces_errors() {
        let (server, guard) = start_guard().await;
        let tiered = guard.tiered();
        server.set_available(false);
        guard.connection().execute(Command::Ping).await;

        assert!(tiered.get("k", false).await.is_err());
        assert!(tiered.set("k", b"v".to_vec(), None, false).await.is_err());
        assert_eq!(tiered.fallback().queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_pending_delete_hides_primary_value() {
        let (server, guard) = start_guard().await;
        let tiered = guard.tiered();
        tiered.set("k", b"v".to_vec(), None, true).await.unwrap();

        server.set_available(false);
        assert!(tiered.delete("k", true).await.unwrap());
        assert_eq!(tiered.get("k", true).await.unwrap(), None);
        assert!(tiered.fallback().has_pending_delete("k").await);
        assert!(server.contains_key("k"));

        server.set_available(true);
        let fallback = tiered.fallback();
        assert!(eventually_async(move || async move { fallback.queue_len().await == 0 }).await);
        assert!(!server.contains_key("k"));
    }

    #[tokio::test]
    async fn test_set_members_union_while_degraded() {
        let (server, guard) = start_guard().await;
        let tiered = guard.tiered();
        tiered.set_add("idx", "a").await.unwrap();

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        tiered.set_add("idx", "b").await.unwrap();
        assert_eq!(tiered.set_members("idx").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_keys_unions_both_tiers() {
        let mut config = test_config();
        config.fallback.mirror_writes = false;
        let (_server, guard) = start_guard_with(config).await;
        let tiered = guard.tiered();
        tiered.set("p:1", b"1".to_vec(), None, true).await.unwrap();
        tiered.fallback().memory().set("p:2", b"2".to_vec(), None).await.unwrap();

        assert_eq!(tiered.primary_keys("p:*").await, vec!["p:1"]);
        assert_eq!(tiered.memory_keys("p:*").await, vec!["p:2"]);
        assert_eq!(tiered.keys("p:*", true).await, vec!["p:1", "p:2"]);
        assert_eq!(tiered.keys("p:*", false).await, vec!["p:1"]);
    }
}

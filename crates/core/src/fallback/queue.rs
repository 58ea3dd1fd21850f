use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::Command;

/// A write that still has to reach the primary backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueuedWrite {
    Set {
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    },
    Delete,
    SetAdd {
        member: String,
    },
    SetRemove {
        member: String,
    },
}

/// A queued write together with its key and enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackQueueEntry {
    pub key: String,
    pub write: QueuedWrite,
    pub queued_at: DateTime<Utc>,
}

impl FallbackQueueEntry {
    pub fn new(key: impl Into<String>, write: QueuedWrite, queued_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            write,
            queued_at,
        }
    }

    /// Builds the replay command for this entry at `now`.
    ///
    /// A `Set` keeps only the TTL it had left, so time spent in the queue is
    /// not added to the key's lifetime. Returns `None` when that TTL has
    /// already run out.
    pub fn to_command(&self, now: DateTime<Utc>) -> Option<Command> {
        let key = self.key.clone();
        let command = match &self.write {
            QueuedWrite::Set { value, ttl_seconds } => {
                let ttl_seconds = match ttl_seconds {
                    Some(ttl) => Some(self.remaining_ttl(*ttl, now)?),
                    None => None,
                };
                Command::Set {
                    key,
                    value: value.clone(),
                    ttl_seconds,
                }
            }
            QueuedWrite::Delete => Command::Del { keys: vec![key] },
            QueuedWrite::SetAdd { member } => Command::SetAdd {
                key,
                member: member.clone(),
            },
            QueuedWrite::SetRemove { member } => Command::SetRemove {
                key,
                member: member.clone(),
            },
        };
        Some(command)
    }

    fn remaining_ttl(&self, ttl: u64, now: DateTime<Utc>) -> Option<u64> {
        let waited_ms = (now - self.queued_at).num_milliseconds().max(0) as u64;
        let left_ms = ttl.saturating_mul(1000).checked_sub(waited_ms)?;
        if left_ms == 0 {
            return None;
        }
        Some(left_ms.div_ceil(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn queued_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap()
    }

    fn set_entry(ttl_seconds: Option<u64>) -> FallbackQueueEntry {
        FallbackQueueEntry::new(
            "app:k",
            QueuedWrite::Set {
                value: b"1".to_vec(),
                ttl_seconds,
            },
            queued_at(),
        )
    }

    #[test]
    fn test_set_ttl_is_reduced_by_queue_time() {
        let command = set_entry(Some(60))
            .to_command(queued_at() + Duration::seconds(20))
            .unwrap();
        assert_eq!(command, Command::set("app:k", b"1".to_vec(), Some(40)));
    }

    #[test]
    fn test_expired_set_is_dropped() {
        assert!(set_entry(Some(10))
            .to_command(queued_at() + Duration::seconds(10))
            .is_none());
        assert!(set_entry(Some(10))
            .to_command(queued_at() + Duration::seconds(30))
            .is_none());
    }

    #[test]
    fn test_set_without_ttl_is_kept() {
        let command = set_entry(None)
            .to_command(queued_at() + Duration::days(2))
            .unwrap();
        assert_eq!(command, Command::set("app:k", b"1".to_vec(), None));
    }

    #[test]
    fn test_other_writes_map_to_commands() {
        let delete = FallbackQueueEntry::new("k", QueuedWrite::Delete, queued_at());
        assert_eq!(delete.to_command(queued_at()), Some(Command::del("k")));

        let add = FallbackQueueEntry::new(
            "idx",
            QueuedWrite::SetAdd {
                member: "s1".into(),
            },
            queued_at(),
        );
        assert_eq!(
            add.to_command(queued_at()),
            Some(Command::SetAdd {
                key: "idx".into(),
                member: "s1".into()
            })
        );
    }
}

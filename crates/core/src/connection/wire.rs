//! Backend-agnostic command and reply model.
//!
//! Components describe what they want from the primary backend with
//! [`Command`]; transports translate it to their wire protocol and hand back a
//! [`Reply`].

/// A single command for the primary backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Get {
        key: String,
    },
    Set {
        key: String,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    },
    Del {
        keys: Vec<String>,
    },
    Exists {
        key: String,
    },
    Expire {
        key: String,
        seconds: u64,
    },
    /// Enumerates keys matching a glob pattern (SCAN on Redis).
    Scan {
        pattern: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    SetMembers {
        key: String,
    },
    Info {
        section: Option<String>,
    },
    ConfigSet {
        parameter: String,
        value: String,
    },
}

impl Command {
    pub fn get(key: impl Into<String>) -> Self {
        Command::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: Vec<u8>, ttl_seconds: Option<u64>) -> Self {
        Command::Set {
            key: key.into(),
            value,
            ttl_seconds,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Command::Del {
            keys: vec![key.into()],
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Command::Exists { key: key.into() }
    }

    pub fn info(section: impl Into<String>) -> Self {
        Command::Info {
            section: Some(section.into()),
        }
    }

    /// Protocol-level name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::Expire { .. } => "EXPIRE",
            Command::Scan { .. } => "SCAN",
            Command::SetAdd { .. } => "SADD",
            Command::SetRemove { .. } => "SREM",
            Command::SetMembers { .. } => "SMEMBERS",
            Command::Info { .. } => "INFO",
            Command::ConfigSet { .. } => "CONFIG SET",
        }
    }

    /// Returns true for commands that mutate data.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Set { .. }
                | Command::Del { .. }
                | Command::Expire { .. }
                | Command::SetAdd { .. }
                | Command::SetRemove { .. }
        )
    }
}

/// A reply from the primary backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Integer(i64),
    Bulk(Vec<u8>),
    Status(String),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Returns the payload of a bulk or status reply.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Reply::Bulk(bytes) => Some(bytes),
            Reply::Status(text) => Some(text.into_bytes()),
            _ => None,
        }
    }

    /// Returns the payload as UTF-8 text.
    pub fn into_text(self) -> Option<String> {
        self.into_bytes()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Flattens an array reply into strings, skipping non-text items.
    pub fn into_strings(self) -> Vec<String> {
        match self {
            Reply::Array(items) => items.into_iter().filter_map(Reply::into_text).collect(),
            other => other.into_text().into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        assert_eq!(
            Command::del("a"),
            Command::Del {
                keys: vec!["a".to_string()]
            }
        );
        assert_eq!(Command::get("a").name(), "GET");
        assert_eq!(
            Command::info("memory"),
            Command::Info {
                section: Some("memory".to_string())
            }
        );
    }

    #[test]
    fn test_is_write() {
        assert!(Command::set("a", vec![], None).is_write());
        assert!(Command::del("a").is_write());
        assert!(!Command::get("a").is_write());
        assert!(!Command::Ping.is_write());
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::Bulk(b"v".to_vec()).into_bytes(), Some(b"v".to_vec()));
        assert_eq!(Reply::Nil.into_bytes(), None);
        assert_eq!(Reply::Status("PONG".into()).into_text().as_deref(), Some("PONG"));
        assert_eq!(Reply::Integer(3).as_integer(), Some(3));
        assert!(Reply::Nil.is_nil());
    }

    #[test]
    fn test_into_strings() {
        let reply = Reply::Array(vec![
            Reply::Bulk(b"a".to_vec()),
            Reply::Nil,
            Reply::Status("b".into()),
        ]);
        assert_eq!(reply.into_strings(), vec!["a".to_string(), "b".to_string()]);
        assert!(Reply::Nil.into_strings().is_empty());
    }
}

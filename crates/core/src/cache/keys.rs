use uuid::Uuid;

use super::patterns::escape_glob;
use crate::session::SessionId;

/// Joins a prefix and a name into a namespaced key (`{prefix}:{name}`).
///
/// An empty prefix leaves the name untouched.
pub fn namespaced_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}:{}", prefix, name)
    }
}

/// Returns the storage key for a session record.
pub fn session_key(prefix: &str, id: &SessionId) -> String {
    namespaced_key(prefix, &format!("session:{}", id))
}

/// Returns the pattern matching every session record under a prefix.
pub fn session_pattern(prefix: &str) -> String {
    namespaced_key(prefix, "session:*")
}

/// Returns the set key indexing the sessions owned by a user.
pub fn owner_sessions_key(prefix: &str, owner_id: &str) -> String {
    namespaced_key(prefix, &format!("owner_sessions:{}", owner_id))
}

/// Extracts the session ID from a session record key.
///
/// # Examples
///
/// ```
/// use kvguard_core::cache::extract_session_id;
///
/// let id = extract_session_id("app", "app:session:abc").unwrap();
/// assert_eq!(id.as_str(), "abc");
/// assert!(extract_session_id("app", "app:owner_sessions:u1").is_none());
/// ```
pub fn extract_session_id(prefix: &str, key: &str) -> Option<SessionId> {
    let marker = namespaced_key(prefix, "session:");
    let id = key.strip_prefix(&marker)?;
    if id.is_empty() || id.contains(':') {
        return None;
    }
    Some(SessionId::new(id.to_string()))
}

/// Returns the key a persistent pub/sub message is stored under.
pub fn persistent_message_key(prefix: &str, channel: &str, message_id: Uuid) -> String {
    namespaced_key(prefix, &format!("persistent_msg:{}:{}", channel, message_id))
}

/// Returns the pattern matching every persistent message of a channel.
///
/// Glob metacharacters in the prefix and channel are escaped.
pub fn persistent_message_pattern(prefix: &str, channel: &str) -> String {
    namespaced_key(
        &escape_glob(prefix),
        &format!("persistent_msg:{}:*", escape_glob(channel)),
    )
}

/// Returns a throwaway key for the health performance probe.
pub fn health_probe_key(prefix: &str, probe_id: Uuid) -> String {
    namespaced_key(prefix, &format!("health:probe:{}", probe_id))
}

/// Returns the pub/sub channel for a conversation.
pub fn conversation_channel(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

/// Returns the pub/sub channel for a user's personal notifications.
pub fn user_channel(user_id: &str) -> String {
    format!("user:{}", user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_key() {
        assert_eq!(namespaced_key("app", "user:1"), "app:user:1");
        assert_eq!(namespaced_key("", "user:1"), "user:1");
    }

    #[test]
    fn test_session_keys() {
        let id = SessionId::new("abc".to_string());
        assert_eq!(session_key("app", &id), "app:session:abc");
        assert_eq!(session_pattern("app"), "app:session:*");
        assert_eq!(owner_sessions_key("app", "u1"), "app:owner_sessions:u1");
    }

    #[test]
    fn test_extract_session_id_rejects_foreign_keys() {
        assert!(extract_session_id("app", "other:session:abc").is_none());
        assert!(extract_session_id("app", "app:session:").is_none());
        assert!(extract_session_id("app", "app:session:a:b").is_none());
    }

    #[test]
    fn test_persistent_message_keys() {
        let id = Uuid::nil();
        assert_eq!(
            persistent_message_key("app", "conversation:1", id),
            "app:persistent_msg:conversation:1:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            persistent_message_pattern("app", "conversation:1"),
            "app:persistent_msg:conversation:1:*"
        );
    }

    #[test]
    fn test_persistent_message_pattern_escapes_channel() {
        use crate::cache::pattern_matches;

        let pattern = persistent_message_pattern("app", "room[1]*");
        assert_eq!(pattern, r"app:persistent_msg:room\[1\]\*:*");
        let key = persistent_message_key("app", "room[1]*", Uuid::nil());
        assert!(pattern_matches(&pattern, &key));
        let other = persistent_message_key("app", "room1x", Uuid::nil());
        assert!(!pattern_matches(&pattern, &other));
    }

    #[test]
    fn test_channels() {
        assert_eq!(conversation_channel("c-9"), "conversation:c-9");
        assert_eq!(user_channel("u-1"), "user:u-1");
    }

    #[test]
    fn test_health_probe_key() {
        assert_eq!(
            health_probe_key("app", Uuid::nil()),
            "app:health:probe:00000000-0000-0000-0000-000000000000"
        );
    }
}

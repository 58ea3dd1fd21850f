use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// A published message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubMessage<T = Value> {
    pub id: Uuid,
    pub channel: String,
    pub payload: T,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Identifies the publishing process, used to drop its own remote echo.
    pub origin_instance: Uuid,
}

impl PubSubMessage<Value> {
    /// Decodes the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Serialization` if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Options for `publish`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    /// Also store the message for late joiners.
    pub persistent: bool,
    /// TTL of the stored copy when `persistent` is set.
    pub ttl_seconds: u64,
    pub origin_user_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Option<Value>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            ttl_seconds: 86_400,
            origin_user_id: None,
            session_id: None,
            metadata: None,
        }
    }
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the message for `ttl_seconds`.
    pub fn persistent(mut self, ttl_seconds: u64) -> Self {
        self.persistent = true;
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_origin_user(mut self, user_id: impl Into<String>) -> Self {
        self.origin_user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Options for `subscribe`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Treat the channel as a glob pattern.
    pub pattern: bool,
}

impl SubscribeOptions {
    pub fn pattern() -> Self {
        Self { pattern: true }
    }
}

/// Identifies one local handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Per-channel broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel: String,
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub buffered: usize,
    pub dropped: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ChannelStats {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }
}

/// Broker-wide view used by health checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSummary {
    pub channels: usize,
    pub patterns: usize,
    pub subscribers: usize,
    pub buffered: usize,
    pub dropped: u64,
    pub per_channel: HashMap<String, ChannelStats>,
}

/// Application events carried on conversation and user channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Typing {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    ResponseDelta {
        conversation_id: String,
        message_id: String,
        delta: String,
        done: bool,
    },
    Presence {
        user_id: String,
        online: bool,
    },
    Notification {
        user_id: String,
        title: String,
        body: String,
    },
}

impl ChatEvent {
    /// Channel the event belongs on.
    pub fn channel(&self) -> String {
        use crate::cache::{conversation_channel, user_channel};
        match self {
            ChatEvent::Typing {
                conversation_id, ..
            }
            | ChatEvent::ResponseDelta {
                conversation_id, ..
            } => conversation_channel(conversation_id),
            ChatEvent::Presence { user_id, .. } | ChatEvent::Notification { user_id, .. } => {
                user_channel(user_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_as() {
        let message = PubSubMessage {
            id: Uuid::new_v4(),
            channel: "c".into(),
            payload: json!({"user_id": "u1", "online": true, "type": "presence"}),
            published_at: Utc::now(),
            origin_user_id: None,
            session_id: None,
            metadata: None,
            origin_instance: Uuid::new_v4(),
        };
        let event: ChatEvent = message.payload_as().unwrap();
        assert_eq!(
            event,
            ChatEvent::Presence {
                user_id: "u1".into(),
                online: true
            }
        );
        assert!(message.payload_as::<u32>().is_err());
    }

    #[test]
    fn test_publish_options_builder() {
        let options = PublishOptions::new().persistent(60).with_origin_user("u1");
        assert!(options.persistent);
        assert_eq!(options.ttl_seconds, 60);
        assert_eq!(options.origin_user_id.as_deref(), Some("u1"));
        assert_eq!(PublishOptions::default().ttl_seconds, 86_400);
    }

    #[test]
    fn test_chat_event_channels() {
        let typing = ChatEvent::Typing {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            is_typing: true,
        };
        assert_eq!(typing.channel(), "conversation:c1");
        let note = ChatEvent::Notification {
            user_id: "u2".into(),
            title: "t".into(),
            body: "b".into(),
        };
        assert_eq!(note.channel(), "user:u2");
    }
}

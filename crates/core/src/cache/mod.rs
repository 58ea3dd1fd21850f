mod envelope;
mod keys;
mod patterns;
mod types;

pub use envelope::{decode, encode, Compression, Encoded};
pub use keys::{
    conversation_channel, extract_session_id, health_probe_key, namespaced_key,
    owner_sessions_key, persistent_message_key, persistent_message_pattern, session_key,
    session_pattern, user_channel,
};
pub use patterns::{escape_glob, is_pattern, pattern_matches};
pub use types::{CacheEntry, CacheOptions, CacheStats};

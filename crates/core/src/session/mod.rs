mod types;

pub use types::{SessionId, SessionOptions, SessionRecord, SessionStats};

mod mode;
mod queue;

pub use mode::{FallbackMode, FallbackSignal};
pub use queue::{FallbackQueueEntry, QueuedWrite};

mod buffer;
mod types;

pub use buffer::BoundedBuffer;
pub use types::{
    BrokerSummary, ChannelStats, ChatEvent, PubSubMessage, PublishOptions, SubscribeOptions,
    SubscriptionId,
};

mod backoff;
mod state;
mod traits;
mod wire;

pub use backoff::Backoff;
pub use state::{ConnectionHealth, ConnectionState};
pub use traits::{RemoteMessage, SubscriptionHandle, SubscriptionTarget, Transport};
pub use wire::{Command, Reply};

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::wire::{Command, Reply};
use crate::error::Result;

/// What a remote subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionTarget {
    Channel(String),
    Pattern(String),
}

impl SubscriptionTarget {
    pub fn name(&self) -> &str {
        match self {
            SubscriptionTarget::Channel(name) | SubscriptionTarget::Pattern(name) => name,
        }
    }
}

impl fmt::Display for SubscriptionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionTarget::Channel(name) => write!(f, "channel:{}", name),
            SubscriptionTarget::Pattern(name) => write!(f, "pattern:{}", name),
        }
    }
}

/// A raw message received on a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Cancels a remote subscription when dropped.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stops the subscription now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Wire-level access to the primary backend.
///
/// Implementations own the command, publisher and subscriber connections.
/// They report failures as errors and never retry on their own: retry,
/// backoff and timeouts belong to the connection manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name for logs (e.g. `"redis"`).
    fn name(&self) -> &'static str;

    /// Establishes (or re-establishes) the logical connections.
    async fn connect(&self) -> Result<()>;

    /// Runs a single command on the command connection.
    async fn execute(&self, command: Command) -> Result<Reply>;

    /// Runs a batch of commands in one round trip, replies in order.
    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>>;

    /// Publishes a payload on the publisher connection.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Opens a subscription; received messages are forwarded to `sink` until
    /// the handle is dropped or the connection is lost.
    async fn subscribe(
        &self,
        target: SubscriptionTarget,
        sink: mpsc::UnboundedSender<RemoteMessage>,
    ) -> Result<SubscriptionHandle>;

    /// Closes every owned connection.
    async fn close(&self);
}

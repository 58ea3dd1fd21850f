//! Pub/sub broker.
//!
//! Local handlers are kept in a topic registry (channel or glob pattern to an
//! ordered handler list) and invoked in-process on every publish. Remote
//! delivery goes through the primary transport; while it is down, outgoing
//! messages wait in a bounded per-channel buffer that is flushed in order on
//! reconnect.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedMutexGuard};
use uuid::Uuid;

use kvguard_core::cache::{pattern_matches, persistent_message_key, persistent_message_pattern};
use kvguard_core::connection::{RemoteMessage, SubscriptionHandle, SubscriptionTarget};
use kvguard_core::pubsub::{
    BoundedBuffer, BrokerSummary, ChannelStats, ChatEvent, PubSubMessage, PublishOptions,
    SubscribeOptions, SubscriptionId,
};

use crate::connection::ConnectionManager;
use crate::tiered::TieredStore;

/// Remote message ids remembered to drop duplicate deliveries.
const RECENT_IDS: usize = 1024;

pub type MessageHandler = Arc<dyn Fn(&PubSubMessage) + Send + Sync>;

struct Topic {
    target: SubscriptionTarget,
    handlers: Vec<(SubscriptionId, MessageHandler)>,
    remote: Option<SubscriptionHandle>,
}

impl Topic {
    fn new(target: SubscriptionTarget) -> Self {
        Self {
            target,
            handlers: Vec::new(),
            remote: None,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    channels: HashMap<String, Topic>,
    patterns: BTreeMap<String, Topic>,
    buffers: HashMap<String, BoundedBuffer<Vec<u8>>>,
    stats: HashMap<String, ChannelStats>,
    recent: VecDeque<Uuid>,
    recent_set: HashSet<Uuid>,
}

impl BrokerState {
    fn topic_mut(&mut self, channel: &str, pattern: bool) -> Option<&mut Topic> {
        if pattern {
            self.patterns.get_mut(channel)
        } else {
            self.channels.get_mut(channel)
        }
    }

    fn stats_mut(&mut self, channel: &str) -> &mut ChannelStats {
        self.stats
            .entry(channel.to_string())
            .or_insert_with(|| ChannelStats::new(channel))
    }

    fn has_subscribers(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
            || self
                .patterns
                .keys()
                .any(|pattern| pattern_matches(pattern, channel))
    }

    /// Forgets a channel nobody listens on once its buffer is empty and
    /// nothing was dropped from it.
    fn prune(&mut self, channel: &str) {
        if self.has_subscribers(channel) {
            return;
        }
        let buffered = self.buffers.get(channel).is_some_and(|buffer| !buffer.is_empty());
        if buffered {
            return;
        }
        self.buffers.remove(channel);
        if self.stats.get(channel).is_some_and(|stats| stats.dropped == 0) {
            self.stats.remove(channel);
        }
    }

    /// Records `id`, returning false if it was already seen.
    fn remember(&mut self, id: Uuid) -> bool {
        if !self.recent_set.insert(id) {
            return false;
        }
        self.recent.push_back(id);
        if self.recent.len() > RECENT_IDS {
            if let Some(old) = self.recent.pop_front() {
                self.recent_set.remove(&old);
            }
        }
        true
    }
}

/// Per-channel publish locks. An entry lives while someone holds or waits on it.
#[derive(Default)]
struct ChannelLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChannelLocks {
    async fn acquire(&self, channel: &str) -> ChannelGuard<'_> {
        let lock = Arc::clone(self.map().entry(channel.to_string()).or_default());
        let guard = lock.lock_owned().await;
        ChannelGuard {
            locks: self,
            channel: channel.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.map().len()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ChannelGuard<'a> {
    locks: &'a ChannelLocks,
    channel: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.map();
        if locks
            .get(&self.channel)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.channel);
        }
    }
}

pub struct PubSubBroker {
    connection: Arc<ConnectionManager>,
    tiered: Arc<TieredStore>,
    key_prefix: String,
    buffer_size: usize,
    instance_id: Uuid,
    next_id: AtomicU64,
    state: Mutex<BrokerState>,
    /// Keeps one channel's sends in order while its buffer is flushed.
    channel_locks: ChannelLocks,
    remote_tx: mpsc::UnboundedSender<RemoteMessage>,
    remote_rx: Mutex<Option<mpsc::UnboundedReceiver<RemoteMessage>>>,
}

impl PubSubBroker {
    pub fn new(
        connection: Arc<ConnectionManager>,
        tiered: Arc<TieredStore>,
        key_prefix: impl Into<String>,
        buffer_size: usize,
    ) -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            connection,
            tiered,
            key_prefix: key_prefix.into(),
            buffer_size,
            instance_id: Uuid::new_v4(),
            next_id: AtomicU64::new(1),
            state: Mutex::new(BrokerState::default()),
            channel_locks: ChannelLocks::default(),
            remote_tx,
            remote_rx: Mutex::new(Some(remote_rx)),
        }
    }

    /// Identifies this process in published messages.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Hands out the receiver of remote messages; only the first call gets it.
    pub fn take_remote_receiver(&self) -> Option<mpsc::UnboundedReceiver<RemoteMessage>> {
        self.remote_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Registers a local handler on a channel, or on a glob pattern with
    /// `opts.pattern`. The first handler of a topic also opens the remote
    /// subscription when the primary is reachable.
    pub async fn subscribe<F>(&self, channel: &str, handler: F, opts: &SubscribeOptions) -> SubscriptionId
    where
        F: Fn(&PubSubMessage) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let target = if opts.pattern {
            SubscriptionTarget::Pattern(channel.to_string())
        } else {
            SubscriptionTarget::Channel(channel.to_string())
        };

        let needs_remote = {
            let mut state = self.lock();
            let topic = if opts.pattern {
                state
                    .patterns
                    .entry(channel.to_string())
                    .or_insert_with(|| Topic::new(target.clone()))
            } else {
                state
                    .channels
                    .entry(channel.to_string())
                    .or_insert_with(|| Topic::new(target.clone()))
            };
            topic.handlers.push((id, Arc::new(handler)));
            topic.remote.is_none()
        };

        if needs_remote && self.connection.is_available() {
            self.attach_remote(target).await;
        }
        tracing::debug!(channel, subscription = id.0, pattern = opts.pattern, "Subscribed");
        id
    }

    /// Removes one handler, or every handler when `id` is `None`.
    ///
    /// Returns the number of handlers removed. The remote subscription is
    /// closed once a topic has no handlers left.
    pub fn unsubscribe(&self, channel: &str, id: Option<SubscriptionId>) -> usize {
        let (removed, emptied) = {
            let mut state = self.lock();
            let pattern = !state.channels.contains_key(channel);
            let Some(topic) = state.topic_mut(channel, pattern) else {
                return 0;
            };
            let before = topic.handlers.len();
            match id {
                Some(id) => topic.handlers.retain(|(handler_id, _)| *handler_id != id),
                None => topic.handlers.clear(),
            }
            let removed = before - topic.handlers.len();
            let emptied = if topic.handlers.is_empty() {
                if pattern {
                    state.patterns.remove(channel)
                } else {
                    state.channels.remove(channel)
                }
            } else {
                None
            };
            if emptied.is_some() {
                state.prune(channel);
            }
            (removed, emptied)
        };
        // Dropping the topic cancels its remote subscription.
        drop(emptied);
        removed
    }

    /// Publishes a message.
    ///
    /// Local handlers always run. Returns true when the primary transport
    /// took the message; otherwise it is buffered for the next reconnect.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        payload: &T,
        opts: &PublishOptions,
    ) -> bool {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(channel, error = %err, "Failed to serialize message");
                return false;
            }
        };
        let message = PubSubMessage {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            payload,
            published_at: Utc::now(),
            origin_user_id: opts.origin_user_id.clone(),
            session_id: opts.session_id.clone(),
            metadata: opts.metadata.clone(),
            origin_instance: self.instance_id,
        };

        {
            let mut state = self.lock();
            state.remember(message.id);
            let stats = state.stats_mut(channel);
            stats.published += 1;
            stats.last_message_at = Some(message.published_at);
        }
        self.deliver_local(&message);

        let bytes = match serde_json::to_vec(&message) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(channel, error = %err, "Failed to encode message");
                self.lock().prune(channel);
                return false;
            }
        };

        if opts.persistent {
            let key = persistent_message_key(&self.key_prefix, channel, message.id);
            if let Err(err) = self
                .tiered
                .set(&key, bytes.clone(), Some(opts.ttl_seconds.max(1)), true)
                .await
            {
                tracing::warn!(channel, error = %err, "Failed to persist message");
            }
        }

        let sent = self.send(channel, bytes).await;
        self.lock().prune(channel);
        sent
    }

    async fn send(&self, channel: &str, bytes: Vec<u8>) -> bool {
        if !self.connection.is_available() {
            self.buffer(channel, bytes);
            return false;
        }
        let _order = self.channel_locks.acquire(channel).await;
        if self.has_buffered(channel) {
            self.buffer(channel, bytes);
            return self.flush_channel(channel).await.is_some();
        }
        match self.connection.try_publish(channel, &bytes).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(channel, error = %err, "Publish failed, buffering");
                self.buffer(channel, bytes);
                false
            }
        }
    }

    /// Publishes an application event on the channel it belongs to.
    pub async fn publish_event(&self, event: &ChatEvent, opts: &PublishOptions) -> bool {
        self.publish(&event.channel(), event, opts).await
    }

    /// Delivers a message received on the subscriber connection.
    ///
    /// Messages this process published, and duplicates already delivered,
    /// are dropped.
    pub fn handle_remote(&self, remote: RemoteMessage) {
        let message: PubSubMessage = match serde_json::from_slice(&remote.payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(channel = %remote.channel, error = %err, "Ignoring malformed remote message");
                return;
            }
        };
        if message.origin_instance == self.instance_id {
            return;
        }
        if !self.lock().remember(message.id) {
            return;
        }
        self.deliver_local(&message);
    }

    /// Drops remote subscriptions after the primary went away.
    pub fn on_disconnected(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut state = self.lock();
            let state = &mut *state;
            state
                .channels
                .values_mut()
                .chain(state.patterns.values_mut())
                .filter_map(|topic| topic.remote.take())
                .collect()
        };
        drop(handles);
    }

    /// Re-establishes remote subscriptions and flushes buffered messages.
    pub async fn on_connected(&self) {
        let targets: Vec<SubscriptionTarget> = {
            let state = self.lock();
            state
                .channels
                .values()
                .chain(state.patterns.values())
                .filter(|topic| topic.remote.is_none())
                .map(|topic| topic.target.clone())
                .collect()
        };
        for target in targets {
            self.attach_remote(target).await;
        }
        self.flush_buffers().await;
    }

    /// Publishes buffered messages, channel by channel, oldest first.
    ///
    /// Stops at the first failure and puts the unsent messages back. Returns
    /// true when every buffer was emptied.
    pub async fn flush_buffers(&self) -> bool {
        let channels: Vec<String> = {
            let state = self.lock();
            let mut channels: Vec<String> = state
                .buffers
                .iter()
                .filter(|(_, buffer)| !buffer.is_empty())
                .map(|(channel, _)| channel.clone())
                .collect();
            channels.sort();
            channels
        };

        let mut flushed = 0;
        for channel in channels {
            let _order = self.channel_locks.acquire(&channel).await;
            match self.flush_channel(&channel).await {
                Some(sent) => flushed += sent,
                None => return false,
            }
        }
        if flushed > 0 {
            tracing::info!(flushed, "Flushed buffered messages");
        }
        true
    }

    /// Sends one channel's buffer, oldest first. The caller holds the
    /// channel's lock. Returns `None` if a send failed; the unsent messages
    /// go back in front of anything buffered meanwhile.
    async fn flush_channel(&self, channel: &str) -> Option<usize> {
        let pending = match self.lock().buffers.remove(channel) {
            Some(mut buffer) => buffer.drain(),
            None => return Some(0),
        };
        for (sent, payload) in pending.iter().enumerate() {
            if let Err(err) = self.connection.try_publish(channel, payload).await {
                tracing::warn!(channel, error = %err, "Buffer flush interrupted");
                let unsent = pending[sent..].to_vec();
                let size = self.buffer_size;
                self.lock()
                    .buffers
                    .entry(channel.to_string())
                    .or_insert_with(|| BoundedBuffer::new(size))
                    .restore(unsent);
                return None;
            }
        }
        self.lock().prune(channel);
        Some(pending.len())
    }

    /// Stored messages of a channel: the most recent `limit`, oldest first.
    pub async fn get_persistent_messages(&self, channel: &str, limit: usize) -> Vec<PubSubMessage> {
        let pattern = persistent_message_pattern(&self.key_prefix, channel);
        let mut messages = Vec::new();
        for key in self.tiered.keys(&pattern, true).await {
            let bytes = match self.tiered.get(&key, true).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!(key = %key, error = %err, "Failed to read persistent message");
                    continue;
                }
            };
            match serde_json::from_slice::<PubSubMessage>(&bytes) {
                Ok(message) if message.channel == channel => messages.push(message),
                Ok(_) => {}
                Err(err) => tracing::debug!(key = %key, error = %err, "Skipping corrupt message"),
            }
        }
        messages.sort_by(|a, b| a.published_at.cmp(&b.published_at));
        let skip = messages.len().saturating_sub(limit);
        messages.split_off(skip)
    }

    pub fn stats(&self) -> BrokerSummary {
        let state = self.lock();
        let mut per_channel = state.stats.clone();
        for (channel, topic) in &state.channels {
            per_channel
                .entry(channel.clone())
                .or_insert_with(|| ChannelStats::new(channel.as_str()))
                .subscribers = topic.handlers.len();
        }
        for (channel, buffer) in &state.buffers {
            per_channel
                .entry(channel.clone())
                .or_insert_with(|| ChannelStats::new(channel.as_str()))
                .buffered = buffer.len();
        }

        BrokerSummary {
            channels: state.channels.len(),
            patterns: state.patterns.len(),
            subscribers: state
                .channels
                .values()
                .chain(state.patterns.values())
                .map(|topic| topic.handlers.len())
                .sum(),
            buffered: state.buffers.values().map(BoundedBuffer::len).sum(),
            dropped: per_channel.values().map(|stats| stats.dropped).sum(),
            per_channel,
        }
    }

    pub fn channel_stats(&self, channel: &str) -> Option<ChannelStats> {
        self.stats().per_channel.remove(channel)
    }

    /// Drops every handler, remote subscription, buffer and counter.
    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.lock());
        drop(old);
    }

    async fn attach_remote(&self, target: SubscriptionTarget) {
        let handle = match self
            .connection
            .try_subscribe(target.clone(), self.remote_tx.clone())
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::debug!(target = %target, error = %err, "Remote subscribe failed");
                return;
            }
        };

        let unused = {
            let mut state = self.lock();
            let pattern = matches!(target, SubscriptionTarget::Pattern(_));
            match state.topic_mut(target.name(), pattern) {
                Some(topic) if topic.remote.is_none() => {
                    topic.remote = Some(handle);
                    None
                }
                _ => Some(handle),
            }
        };
        drop(unused);
    }

    fn deliver_local(&self, message: &PubSubMessage) {
        let handlers: Vec<MessageHandler> = {
            let state = self.lock();
            let exact = state
                .channels
                .get(&message.channel)
                .into_iter()
                .flat_map(|topic| topic.handlers.iter());
            let patterns = state
                .patterns
                .iter()
                .filter(|(pattern, _)| pattern_matches(pattern, &message.channel))
                .flat_map(|(_, topic)| topic.handlers.iter());
            exact
                .chain(patterns)
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::error!(channel = %message.channel, "Message handler panicked"),
            }
        }
        if delivered > 0 {
            self.lock().stats_mut(&message.channel).delivered += delivered;
        }
    }

    fn buffer(&self, channel: &str, bytes: Vec<u8>) {
        let mut state = self.lock();
        let size = self.buffer_size;
        let dropped = state
            .buffers
            .entry(channel.to_string())
            .or_insert_with(|| BoundedBuffer::new(size))
            .push(bytes)
            .is_some();
        if dropped {
            state.stats_mut(channel).dropped += 1;
            tracing::warn!(channel, "Publish buffer full, dropped oldest message");
        }
    }

    fn has_buffered(&self, channel: &str) -> bool {
        self.lock()
            .buffers
            .get(channel)
            .is_some_and(|buffer| !buffer.is_empty())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, guard_on, start_guard, start_guard_with, test_config};
    use kvguard_core::connection::{Command, Reply};
    use serde_json::{json, Value};

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&PubSubMessage) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |message: &PubSubMessage| {
            sink.lock().unwrap().push(message.payload.clone());
        })
    }

    #[tokio::test]
    async fn test_local_delivery_exactly_once_in_order() {
        let (_server, guard) = start_guard().await;
        let broker = guard.pubsub();
        let (seen, handler) = recorder();
        broker.subscribe("conversation:1", handler, &SubscribeOptions::default()).await;

        for i in 0..50 {
            broker.publish("conversation:1", &i, &PublishOptions::default()).await;
        }
        // Give a remote echo time to arrive; it must not be delivered again.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let expected: Vec<Value> = (0..50).map(|i| json!(i)).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        assert_eq!(broker.channel_stats("conversation:1").unwrap().delivered, 50);
    }

    #[tokio::test]
    async fn test_local_delivery_while_primary_down() {
        let (server, guard) = start_guard().await;
        let broker = guard.pubsub();
        let (seen, handler) = recorder();
        broker.subscribe("c", handler, &SubscribeOptions::default()).await;

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        assert!(!broker.publish("c", &"hello", &PublishOptions::default()).await);
        assert_eq!(*seen.lock().unwrap(), vec![json!("hello")]);
    }

    #[tokio::test]
    async fn test_pattern_subscription() {
        let (_server, guard) = start_guard().await;
        let broker = guard.pubsub();
        let (seen, handler) = recorder();
        broker.subscribe("user:*", handler, &SubscribeOptions::pattern()).await;

        broker.publish("user:1", &1, &PublishOptions::default()).await;
        broker.publish("conversation:1", &2, &PublishOptions::default()).await;
        assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
        assert_eq!(broker.stats().patterns, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (server, guard) = start_guard().await;
        let broker = guard.pubsub();
        let (seen, handler) = recorder();
        let first = broker.subscribe("c", handler, &SubscribeOptions::default()).await;
        let (_, other) = recorder();
        broker.subscribe("c", other, &SubscribeOptions::default()).await;
        assert_eq!(server.subscriber_count(), 1);

        assert_eq!(broker.unsubscribe("c", Some(first)), 1);
        broker.publish("c", &1, &PublishOptions::default()).await;
        assert!(seen.lock().unwrap().is_empty());

        assert_eq!(broker.unsubscribe("c", None), 1);
        assert_eq!(server.subscriber_count(), 0);
        assert_eq!(broker.unsubscribe("c", None), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_others() {
        let (_server, guard) = start_guard().await;
        let broker = guard.pubsub();
        broker
            .subscribe("c", |_: &PubSubMessage| panic!("boom"), &SubscribeOptions::default())
            .await;
        let (seen, handler) = recorder();
        broker.subscribe("c", handler, &SubscribeOptions::default()).await;

        broker.publish("c", &1, &PublishOptions::default()).await;
        assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_cross_instance_delivery() {
        let (server, first) = start_guard().await;
        let second = guard_on(&server, test_config()).await;
        let (seen, handler) = recorder();
        first.pubsub().subscribe("user:7", handler, &SubscribeOptions::default()).await;

        assert!(second.pubsub().publish("user:7", &json!({"n": 1}), &PublishOptions::default()).await);
        let received = Arc::clone(&seen);
        assert!(eventually(move || received.lock().unwrap().len() == 1).await);
        assert_eq!(seen.lock().unwrap()[0], json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_buffer_overflow_and_flush_in_order() {
        let mut config = test_config();
        config.pubsub.buffer_size = 3;
        let (server, guard) = start_guard_with(config).await;
        let broker = guard.pubsub();

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        for i in 0..5 {
            assert!(!broker.publish("c", &i, &PublishOptions::default()).await);
        }
        let summary = broker.stats();
        assert_eq!(summary.buffered, 3);
        assert_eq!(summary.dropped, 2);

        server.set_available(true);
        let observer = Arc::clone(&server);
        assert!(eventually(move || observer.published("c").len() == 3).await);
        let payloads: Vec<Value> = server
            .published("c")
            .iter()
            .map(|bytes| serde_json::from_slice::<PubSubMessage>(bytes).unwrap().payload)
            .collect();
        assert_eq!(payloads, vec![json!(2), json!(3), json!(4)]);
        assert_eq!(broker.stats().buffered, 0);
    }

    #[tokio::test]
    async fn test_publishes_on_different_channels_run_concurrently() {
        let (server, guard) = start_guard().await;
        let broker = guard.pubsub();
        server.set_latency(std::time::Duration::from_millis(200));

        let started = std::time::Instant::now();
        let options = PublishOptions::default();
        let (a, b) = tokio::join!(
            broker.publish("a", &1, &options),
            broker.publish("b", &2, &options)
        );
        assert!(a && b);
        assert!(started.elapsed() < std::time::Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_same_channel_order_holds_while_flushing() {
        let (server, guard) = start_guard().await;
        let broker = guard.pubsub();

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        for i in 0..3 {
            broker.publish("c", &i, &PublishOptions::default()).await;
        }
        server.set_available(true);
        let connection = guard.connection();
        assert!(eventually(|| connection.is_available()).await);
        server.set_latency(std::time::Duration::from_millis(20));

        let options = PublishOptions::default();
        tokio::join!(
            broker.flush_buffers(),
            broker.publish("c", &3, &options)
        );
        let payloads: Vec<Value> = server
            .published("c")
            .iter()
            .map(|bytes| serde_json::from_slice::<PubSubMessage>(bytes).unwrap().payload)
            .collect();
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_idle_channels_leave_no_state() {
        let (server, guard) = start_guard().await;
        let broker = guard.pubsub();
        for i in 0..1000 {
            broker
                .publish(&format!("conversation:{i}"), &i, &PublishOptions::default())
                .await;
        }
        assert!(broker.stats().per_channel.is_empty());

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        for i in 0..10 {
            broker.publish(&format!("user:{i}"), &i, &PublishOptions::default()).await;
        }
        assert_eq!(broker.stats().per_channel.len(), 10);

        server.set_available(true);
        assert!(eventually(|| broker.stats().per_channel.is_empty()).await);
        assert!(broker.lock().buffers.is_empty());
        assert_eq!(broker.channel_locks.len(), 0);
        assert_eq!(server.published("user:9").len(), 1);
    }

    #[tokio::test]
    async fn test_subscribed_and_overflowed_channels_keep_stats() {
        let mut config = test_config();
        config.pubsub.buffer_size = 1;
        let (server, guard) = start_guard_with(config).await;
        let broker = guard.pubsub();
        let (_, handler) = recorder();
        broker.subscribe("kept", handler, &SubscribeOptions::default()).await;
        broker.publish("kept", &1, &PublishOptions::default()).await;

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        broker.publish("lossy", &1, &PublishOptions::default()).await;
        broker.publish("lossy", &2, &PublishOptions::default()).await;
        server.set_available(true);
        assert!(eventually(|| broker.stats().buffered == 0).await);

        let summary = broker.stats();
        assert_eq!(summary.per_channel["kept"].delivered, 1);
        assert_eq!(summary.per_channel["lossy"].dropped, 1);

        assert_eq!(broker.unsubscribe("kept", None), 1);
        assert!(!broker.stats().per_channel.contains_key("kept"));
    }

    #[tokio::test]
    async fn test_remote_subscriptions_restored_after_outage() {
        let (server, first) = start_guard().await;
        let (seen, handler) = recorder();
        first.pubsub().subscribe("c", handler, &SubscribeOptions::default()).await;

        server.set_available(false);
        first.connection().execute(Command::Ping).await;
        server.set_available(true);
        let observer = Arc::clone(&server);
        assert!(eventually(move || observer.subscriber_count() == 1).await);

        let second = guard_on(&server, test_config()).await;
        second.pubsub().publish("c", &"after", &PublishOptions::default()).await;
        let received = Arc::clone(&seen);
        assert!(eventually(move || received.lock().unwrap().len() == 1).await);
    }

    #[tokio::test]
    async fn test_persistent_messages() {
        let (_server, guard) = start_guard().await;
        let broker = guard.pubsub();
        let opts = PublishOptions::new().persistent(60);
        for i in 0..4 {
            broker.publish("c", &i, &opts).await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        broker.publish("c", &"transient", &PublishOptions::default()).await;
        broker.publish("c:sub", &"other channel", &opts).await;

        let messages = broker.get_persistent_messages("c", 2).await;
        let payloads: Vec<Value> = messages.into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_persistent_scan_ignores_lookalike_channels() {
        let (server, guard) = start_guard().await;
        let broker = guard.pubsub();
        let opts = PublishOptions::new().persistent(60);
        broker.publish("room[1]", &"mine", &opts).await;
        broker.publish("room1", &"lookalike", &opts).await;
        broker.publish("room*", &"star", &opts).await;

        let scanned = server
            .handle(Command::Scan {
                pattern: persistent_message_pattern("test", "room[1]"),
            })
            .unwrap();
        assert!(matches!(scanned, Reply::Array(ref keys) if keys.len() == 1));

        let messages = broker.get_persistent_messages("room*", 10).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, json!("star"));
    }

    #[tokio::test]
    async fn test_publish_event_uses_event_channel() {
        let (_server, guard) = start_guard().await;
        let broker = guard.pubsub();
        let (seen, handler) = recorder();
        broker.subscribe("conversation:42", handler, &SubscribeOptions::default()).await;

        let event = ChatEvent::Typing {
            conversation_id: "42".into(),
            user_id: "u1".into(),
            is_typing: true,
        };
        broker.publish_event(&event, &PublishOptions::default()).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["type"], "typing");
    }

    #[tokio::test]
    async fn test_clear() {
        let (server, guard) = start_guard().await;
        let broker = guard.pubsub();
        let (_, handler) = recorder();
        broker.subscribe("c", handler, &SubscribeOptions::default()).await;
        broker.clear();
        assert_eq!(broker.stats(), BrokerSummary::default());
        assert_eq!(server.subscriber_count(), 0);
    }
}

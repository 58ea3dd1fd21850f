use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;

use kvguard_core::cache::pattern_matches;
use kvguard_core::connection::{Command, RemoteMessage, Reply, SubscriptionTarget};
use kvguard_core::{KvError, Result};

/// Published messages remembered for inspection.
const PUBLISH_LOG_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Members(BTreeSet<String>),
}

impl Value {
    fn size(&self) -> usize {
        match self {
            Value::Bytes(bytes) => bytes.len(),
            Value::Members(members) => members.iter().map(String::len).sum(),
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    value: Value,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct Subscriber {
    id: u64,
    target: SubscriptionTarget,
    sink: mpsc::UnboundedSender<RemoteMessage>,
}

#[derive(Default)]
struct ServerState {
    entries: HashMap<String, Stored>,
    subscribers: Vec<Subscriber>,
    published: VecDeque<RemoteMessage>,
    config: HashMap<String, String>,
    next_subscriber: u64,
    last_save: i64,
}

impl ServerState {
    fn live(&mut self, key: &str) -> Option<&mut Stored> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|s| s.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn used_memory(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, stored)| key.len() + stored.value.size())
            .sum()
    }
}

/// Shared in-process backend.
pub struct LoopbackServer {
    state: Mutex<ServerState>,
    available: AtomicBool,
    /// Bumped on every outage so transports notice their connection died.
    generation: AtomicU64,
    latency_ms: AtomicU64,
}

impl LoopbackServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState {
                last_save: Utc::now().timestamp(),
                ..Default::default()
            }),
            available: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
        })
    }

    /// Takes the server up or down. Going down drops every subscriber.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.lock().subscribers.clear();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Delays every subsequent operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::SeqCst))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Raw value stored under `key`, if it is a live string value.
    pub fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        match &self.lock().live(key)?.value {
            Value::Bytes(bytes) => Some(bytes.clone()),
            Value::Members(_) => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().live(key).is_some()
    }

    /// Payloads published on `channel`, oldest first.
    pub fn published(&self, channel: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|message| message.channel == channel)
            .map(|message| message.payload.clone())
            .collect()
    }

    /// Value last applied with `CONFIG SET`.
    pub fn config_value(&self, parameter: &str) -> Option<String> {
        self.lock().config.get(parameter).cloned()
    }

    pub(crate) fn handle(&self, command: Command) -> Result<Reply> {
        let mut state = self.lock();
        let reply = match command {
            Command::Ping => Reply::Status("PONG".to_string()),
            Command::Get { key } => match state.live(&key).map(|s| &s.value) {
                Some(Value::Bytes(bytes)) => Reply::Bulk(bytes.clone()),
                Some(Value::Members(_)) => return Err(wrong_type()),
                None => Reply::Nil,
            },
            Command::Set {
                key,
                value,
                ttl_seconds,
            } => {
                let expires_at = ttl_seconds
                    .filter(|ttl| *ttl > 0)
                    .map(|ttl| Instant::now() + Duration::from_secs(ttl));
                state.entries.insert(
                    key,
                    Stored {
                        value: Value::Bytes(value),
                        expires_at,
                    },
                );
                Reply::Ok
            }
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    if state.live(&key).is_some() {
                        state.entries.remove(&key);
                        removed += 1;
                    }
                }
                Reply::Integer(removed)
            }
            Command::Exists { key } => Reply::Integer(i64::from(state.live(&key).is_some())),
            Command::Expire { key, seconds } => match state.live(&key) {
                Some(stored) => {
                    stored.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                    Reply::Integer(1)
                }
                None => Reply::Integer(0),
            },
            Command::Scan { pattern } => {
                let now = Instant::now();
                let mut keys: Vec<&String> = state
                    .entries
                    .iter()
                    .filter(|(key, stored)| !stored.is_expired(now) && pattern_matches(&pattern, key))
                    .map(|(key, _)| key)
                    .collect();
                keys.sort();
                Reply::Array(
                    keys.into_iter()
                        .map(|key| Reply::Bulk(key.as_bytes().to_vec()))
                        .collect(),
                )
            }
            Command::SetAdd { key, member } => {
                let stored = state.live(&key).is_some();
                if !stored {
                    state.entries.insert(
                        key.clone(),
                        Stored {
                            value: Value::Members(BTreeSet::new()),
                            expires_at: None,
                        },
                    );
                }
                match state.entries.get_mut(&key).map(|s| &mut s.value) {
                    Some(Value::Members(members)) => Reply::Integer(i64::from(members.insert(member))),
                    _ => return Err(wrong_type()),
                }
            }
            Command::SetRemove { key, member } => {
                let (removed, now_empty) = match state.live(&key).map(|s| &mut s.value) {
                    Some(Value::Members(members)) => {
                        let removed = members.remove(&member);
                        (removed, members.is_empty())
                    }
                    Some(Value::Bytes(_)) => return Err(wrong_type()),
                    None => (false, false),
                };
                if now_empty {
                    state.entries.remove(&key);
                }
                Reply::Integer(i64::from(removed))
            }
            Command::SetMembers { key } => match state.live(&key).map(|s| &s.value) {
                Some(Value::Members(members)) => Reply::Array(
                    members
                        .iter()
                        .map(|member| Reply::Bulk(member.as_bytes().to_vec()))
                        .collect(),
                ),
                Some(Value::Bytes(_)) => return Err(wrong_type()),
                None => Reply::Array(Vec::new()),
            },
            Command::Info { section } => Reply::Bulk(info_text(&state, section.as_deref()).into_bytes()),
            Command::ConfigSet { parameter, value } => {
                state.config.insert(parameter, value);
                Reply::Ok
            }
        };
        Ok(reply)
    }

    /// Delivers a message to matching subscribers, returning how many got it.
    pub(crate) fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        let mut state = self.lock();
        let message = RemoteMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        if state.published.len() >= PUBLISH_LOG_LIMIT {
            state.published.pop_front();
        }
        state.published.push_back(message.clone());
        state.subscribers.retain(|subscriber| !subscriber.sink.is_closed());
        state
            .subscribers
            .iter()
            .filter(|subscriber| match &subscriber.target {
                SubscriptionTarget::Channel(name) => name == channel,
                SubscriptionTarget::Pattern(pattern) => pattern_matches(pattern, channel),
            })
            .filter(|subscriber| subscriber.sink.send(message.clone()).is_ok())
            .count()
    }

    pub(crate) fn subscribe(
        &self,
        target: SubscriptionTarget,
        sink: mpsc::UnboundedSender<RemoteMessage>,
    ) -> u64 {
        let mut state = self.lock();
        state.next_subscriber += 1;
        let id = state.next_subscriber;
        state.subscribers.push(Subscriber { id, target, sink });
        id
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|subscriber| subscriber.id != id);
    }

    /// Number of live subscriber connections.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn wrong_type() -> KvError {
    KvError::OperationFailed(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

fn info_text(state: &ServerState, section: Option<&str>) -> String {
    let memory = format!(
        "# Memory\r\nused_memory:{}\r\nmaxmemory:0\r\nmaxmemory_policy:{}\r\nmem_fragmentation_ratio:1.00\r\n",
        state.used_memory(),
        state
            .config
            .get("maxmemory-policy")
            .map(String::as_str)
            .unwrap_or("noeviction"),
    );
    let persistence = format!(
        "# Persistence\r\nrdb_last_save_time:{}\r\nrdb_last_bgsave_status:ok\r\naof_enabled:0\r\n",
        state.last_save
    );
    let keyspace = format!("# Keyspace\r\ndb0:keys={}\r\n", state.entries.len());
    match section {
        Some("memory") => memory,
        Some("persistence") => persistence,
        Some("keyspace") => keyspace,
        _ => format!("{}\r\n{}\r\n{}", memory, persistence, keyspace),
    }
}

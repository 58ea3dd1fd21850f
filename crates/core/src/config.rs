//! Validated runtime configuration.
//!
//! The shell builds a [`StoreConfig`] (usually from environment variables)
//! and hands it to the context object, which refuses to start unless
//! [`StoreConfig::validate`] succeeds.

use std::collections::HashSet;
use std::time::Duration;

use crate::connection::Backoff;
use crate::error::{KvError, Result};
use crate::health::{CheckKind, HealthThresholds};

const EVICTION_POLICIES: [&str; 8] = [
    "noeviction",
    "allkeys-lru",
    "allkeys-lfu",
    "allkeys-random",
    "volatile-lru",
    "volatile-lfu",
    "volatile-random",
    "volatile-ttl",
];

/// Primary backend connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub connect_timeout: Duration,
    /// Budget for a single command; a timeout fails only that call.
    pub command_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max_delay: Duration,
    /// Backoff attempts before the loop gives up until the next liveness probe.
    pub max_retries: u32,
    /// Send batches as one pipeline instead of command by command.
    pub auto_pipelining: bool,
    /// `maxmemory-policy` applied on every connect.
    pub eviction_policy: Option<String>,
    pub ping_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            connect_timeout: Duration::from_millis(5000),
            command_timeout: Duration::from_millis(2000),
            retry_base: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            max_retries: 10,
            auto_pipelining: true,
            eviction_policy: None,
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Builds a `redis://` URL; the password is percent-encoded.
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_base, self.retry_max_delay)
    }
}

/// Fallback store and reconciliation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackConfig {
    /// Byte budget of the in-process store.
    pub max_memory_bytes: usize,
    /// Pins the coordinator in degraded mode.
    pub persistent: bool,
    /// Copy successful primary writes into memory as a warm standby.
    pub mirror_writes: bool,
    pub sweep_interval: Duration,
    pub sync_interval: Duration,
    /// Queue entries replayed per pipeline.
    pub replay_batch_size: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 50 * 1024 * 1024,
            persistent: false,
            mirror_writes: true,
            sweep_interval: Duration::from_secs(300),
            sync_interval: Duration::from_secs(30),
            replay_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_ttl_seconds: u64,
    /// Payloads larger than this many bytes are compressed in `Auto` mode.
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 3600,
            compression_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub default_ttl_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// Messages kept per channel while the primary is down.
    pub buffer_size: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self { buffer_size: 100 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub history_size: usize,
    /// Budget for each individual check.
    pub check_timeout: Duration,
    /// Checks reported as skipped.
    pub disabled: HashSet<CheckKind>,
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            history_size: 100,
            check_timeout: Duration::from_secs(5),
            disabled: HashSet::from([CheckKind::Persistence]),
            thresholds: HealthThresholds::default(),
        }
    }
}

impl HealthConfig {
    pub fn is_enabled(&self, kind: CheckKind) -> bool {
        !self.disabled.contains(&kind)
    }
}

/// Everything the substrate needs at construction time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Namespace for every key (`{prefix}:{name}`).
    pub key_prefix: String,
    pub connection: ConnectionConfig,
    pub fallback: FallbackConfig,
    pub cache: CacheConfig,
    pub session: SessionConfig,
    pub pubsub: PubSubConfig,
    pub health: HealthConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "kvguard".to_string(),
            connection: ConnectionConfig::default(),
            fallback: FallbackConfig::default(),
            cache: CacheConfig::default(),
            session: SessionConfig::default(),
            pubsub: PubSubConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Checks that the configuration can run.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Configuration` naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let connection = &self.connection;
        if self.key_prefix.ends_with(':') {
            return invalid("key prefix must not end with ':'");
        }
        if connection.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if connection.port == 0 {
            return invalid("port must be non-zero");
        }
        if connection.db < 0 {
            return invalid("db index must not be negative");
        }
        if connection.connect_timeout.is_zero() || connection.command_timeout.is_zero() {
            return invalid("connect and command timeouts must be positive");
        }
        if connection.retry_base.is_zero() {
            return invalid("retry base delay must be positive");
        }
        if connection.retry_max_delay < connection.retry_base {
            return invalid("retry max delay must not be below the base delay");
        }
        if connection.ping_interval.is_zero() {
            return invalid("ping interval must be positive");
        }
        if let Some(policy) = &connection.eviction_policy {
            if !EVICTION_POLICIES.contains(&policy.as_str()) {
                return invalid(&format!("unknown eviction policy '{}'", policy));
            }
        }
        if self.fallback.max_memory_bytes == 0 {
            return invalid("fallback memory budget must be positive");
        }
        if self.fallback.sweep_interval.is_zero() || self.fallback.sync_interval.is_zero() {
            return invalid("fallback sweep and sync intervals must be positive");
        }
        if self.fallback.replay_batch_size == 0 {
            return invalid("replay batch size must be positive");
        }
        if self.session.default_ttl_seconds == 0 {
            return invalid("session TTL must be positive");
        }
        if self.health.interval.is_zero() || self.health.check_timeout.is_zero() {
            return invalid("health interval and check timeout must be positive");
        }
        if self.health.history_size == 0 {
            return invalid("health history size must be positive");
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Result<()> {
    Err(KvError::Configuration(message.to_string()))
}

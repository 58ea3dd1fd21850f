use std::{env, str::FromStr, time::Duration};

use kvguard_core::config::{
    CacheConfig, ConnectionConfig, FallbackConfig, HealthConfig, PubSubConfig, SessionConfig,
};
use kvguard_core::health::CheckKind;
use kvguard_core::StoreConfig;

/// Which primary backend the binary talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Redis,
    /// In-process stand-in, for local development without Redis.
    Loopback,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "redis" => Ok(TransportKind::Redis),
            "loopback" | "memory" => Ok(TransportKind::Loopback),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Substrate configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Redis host (default: "localhost")
    pub redis_host: String,
    /// Redis port (default: 6379)
    pub redis_port: u16,
    pub redis_password: Option<String>,
    /// Redis database index (default: 0)
    pub redis_db: i64,
    /// Namespace for every key (default: "kvguard")
    pub key_prefix: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_retries: u32,
    pub auto_pipelining: bool,
    pub eviction_policy: Option<String>,
    pub ping_interval_seconds: u64,
    pub cache_default_ttl_seconds: u64,
    pub cache_compression_threshold: usize,
    pub session_default_ttl_seconds: u64,
    pub fallback_max_memory_bytes: usize,
    pub fallback_persistent: bool,
    pub fallback_sweep_interval_seconds: u64,
    pub fallback_sync_interval_seconds: u64,
    pub pubsub_buffer_size: usize,
    pub health_interval_seconds: u64,
    pub health_history_size: usize,
    pub health_check_persistence: bool,
    pub transport: TransportKind,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `REDIS_HOST` - Redis host (default: "localhost")
    /// - `REDIS_PORT` - Redis port (default: 6379)
    /// - `REDIS_PASSWORD` - Redis password (default: none)
    /// - `REDIS_DB` - Redis database index (default: 0)
    /// - `KVGUARD_KEY_PREFIX` - Key namespace (default: "kvguard")
    /// - `REDIS_CONNECT_TIMEOUT_MS` - Connect timeout (default: 5000)
    /// - `REDIS_COMMAND_TIMEOUT_MS` - Per-command timeout (default: 2000)
    /// - `REDIS_RETRY_BASE_MS` - First reconnect delay (default: 500)
    /// - `REDIS_RETRY_MAX_DELAY_MS` - Reconnect delay cap (default: 30000)
    /// - `REDIS_MAX_RETRIES` - Reconnect attempts per outage (default: 10)
    /// - `REDIS_AUTO_PIPELINING` - Batch replays into one pipeline (default: true)
    /// - `REDIS_EVICTION_POLICY` - `maxmemory-policy` to apply (default: none)
    /// - `REDIS_PING_INTERVAL_SECONDS` - Liveness probe interval (default: 30)
    /// - `CACHE_DEFAULT_TTL_SECONDS` - Cache TTL (default: 3600)
    /// - `CACHE_COMPRESSION_THRESHOLD` - Compress payloads above this size (default: 1000)
    /// - `SESSION_DEFAULT_TTL_SECONDS` - Session TTL (default: 86400)
    /// - `FALLBACK_MAX_MEMORY_BYTES` - Fallback store budget (default: 50 MiB)
    /// - `FALLBACK_PERSISTENT` - Never leave fallback mode (default: false)
    /// - `FALLBACK_SWEEP_INTERVAL_SECONDS` - Expiry sweep interval (default: 300)
    /// - `FALLBACK_SYNC_INTERVAL_SECONDS` - Auto-sync interval (default: 30)
    /// - `PUBSUB_BUFFER_SIZE` - Messages buffered per channel (default: 100)
    /// - `HEALTH_INTERVAL_SECONDS` - Health timer interval (default: 60)
    /// - `HEALTH_HISTORY_SIZE` - Reports kept (default: 100)
    /// - `HEALTH_CHECK_PERSISTENCE` - Enable the persistence check (default: false)
    /// - `KVGUARD_TRANSPORT` - `redis` or `loopback` (default: "redis")
    pub fn from_env() -> Self {
        Self {
            redis_host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            redis_port: parse_var("REDIS_PORT", 6379),
            redis_password: env::var("REDIS_PASSWORD").ok().filter(|v| !v.is_empty()),
            redis_db: parse_var("REDIS_DB", 0),
            key_prefix: env::var("KVGUARD_KEY_PREFIX").unwrap_or_else(|_| "kvguard".to_string()),
            connect_timeout_ms: parse_var("REDIS_CONNECT_TIMEOUT_MS", 5_000),
            command_timeout_ms: parse_var("REDIS_COMMAND_TIMEOUT_MS", 2_000),
            retry_base_ms: parse_var("REDIS_RETRY_BASE_MS", 500),
            retry_max_delay_ms: parse_var("REDIS_RETRY_MAX_DELAY_MS", 30_000),
            max_retries: parse_var("REDIS_MAX_RETRIES", 10),
            auto_pipelining: bool_var("REDIS_AUTO_PIPELINING", true),
            eviction_policy: env::var("REDIS_EVICTION_POLICY")
                .ok()
                .filter(|v| !v.is_empty()),
            ping_interval_seconds: parse_var("REDIS_PING_INTERVAL_SECONDS", 30),
            cache_default_ttl_seconds: parse_var("CACHE_DEFAULT_TTL_SECONDS", 3_600),
            cache_compression_threshold: parse_var("CACHE_COMPRESSION_THRESHOLD", 1_000),
            session_default_ttl_seconds: parse_var("SESSION_DEFAULT_TTL_SECONDS", 86_400),
            fallback_max_memory_bytes: parse_var("FALLBACK_MAX_MEMORY_BYTES", 50 * 1024 * 1024),
            fallback_persistent: bool_var("FALLBACK_PERSISTENT", false),
            fallback_sweep_interval_seconds: parse_var("FALLBACK_SWEEP_INTERVAL_SECONDS", 300),
            fallback_sync_interval_seconds: parse_var("FALLBACK_SYNC_INTERVAL_SECONDS", 30),
            pubsub_buffer_size: parse_var("PUBSUB_BUFFER_SIZE", 100),
            health_interval_seconds: parse_var("HEALTH_INTERVAL_SECONDS", 60),
            health_history_size: parse_var("HEALTH_HISTORY_SIZE", 100),
            health_check_persistence: bool_var("HEALTH_CHECK_PERSISTENCE", false),
            transport: parse_var("KVGUARD_TRANSPORT", TransportKind::Redis),
        }
    }

    /// Converts to the core configuration. Validation happens at startup.
    pub fn into_store_config(self) -> StoreConfig {
        let mut health = HealthConfig {
            interval: Duration::from_secs(self.health_interval_seconds),
            history_size: self.health_history_size,
            ..HealthConfig::default()
        };
        if self.health_check_persistence {
            health.disabled.remove(&CheckKind::Persistence);
        }

        StoreConfig {
            key_prefix: self.key_prefix,
            connection: ConnectionConfig {
                host: self.redis_host,
                port: self.redis_port,
                password: self.redis_password,
                db: self.redis_db,
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                command_timeout: Duration::from_millis(self.command_timeout_ms),
                retry_base: Duration::from_millis(self.retry_base_ms),
                retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
                max_retries: self.max_retries,
                auto_pipelining: self.auto_pipelining,
                eviction_policy: self.eviction_policy,
                ping_interval: Duration::from_secs(self.ping_interval_seconds),
            },
            fallback: FallbackConfig {
                max_memory_bytes: self.fallback_max_memory_bytes,
                persistent: self.fallback_persistent,
                sweep_interval: Duration::from_secs(self.fallback_sweep_interval_seconds),
                sync_interval: Duration::from_secs(self.fallback_sync_interval_seconds),
                ..FallbackConfig::default()
            },
            cache: CacheConfig {
                default_ttl_seconds: self.cache_default_ttl_seconds,
                compression_threshold: self.cache_compression_threshold,
            },
            session: SessionConfig {
                default_ttl_seconds: self.session_default_ttl_seconds,
            },
            pubsub: PubSubConfig {
                buffer_size: self.pubsub_buffer_size,
            },
            health,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn bool_var(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 25] = [
        "REDIS_HOST",
        "REDIS_PORT",
        "REDIS_PASSWORD",
        "REDIS_DB",
        "KVGUARD_KEY_PREFIX",
        "REDIS_CONNECT_TIMEOUT_MS",
        "REDIS_COMMAND_TIMEOUT_MS",
        "REDIS_RETRY_BASE_MS",
        "REDIS_RETRY_MAX_DELAY_MS",
        "REDIS_MAX_RETRIES",
        "REDIS_AUTO_PIPELINING",
        "REDIS_EVICTION_POLICY",
        "REDIS_PING_INTERVAL_SECONDS",
        "CACHE_DEFAULT_TTL_SECONDS",
        "CACHE_COMPRESSION_THRESHOLD",
        "SESSION_DEFAULT_TTL_SECONDS",
        "FALLBACK_MAX_MEMORY_BYTES",
        "FALLBACK_PERSISTENT",
        "FALLBACK_SWEEP_INTERVAL_SECONDS",
        "FALLBACK_SYNC_INTERVAL_SECONDS",
        "PUBSUB_BUFFER_SIZE",
        "HEALTH_INTERVAL_SECONDS",
        "HEALTH_HISTORY_SIZE",
        "HEALTH_CHECK_PERSISTENCE",
        "KVGUARD_TRANSPORT",
    ];

    #[test]
    fn test_default_values() {
        // Clear environment variables to test defaults
        for var in VARS {
            env::remove_var(var);
        }

        let config = Config::from_env();

        assert_eq!(config.redis_host, "localhost");
        assert_eq!(config.redis_port, 6379);
        assert_eq!(config.redis_password, None);
        assert_eq!(config.key_prefix, "kvguard");
        assert_eq!(config.command_timeout_ms, 2_000);
        assert!(config.auto_pipelining);
        assert_eq!(config.fallback_max_memory_bytes, 52_428_800);
        assert_eq!(config.transport, TransportKind::Redis);

        let store = config.into_store_config();
        assert_eq!(store, StoreConfig::default());
        assert!(store.validate().is_ok());
    }

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("redis".parse::<TransportKind>(), Ok(TransportKind::Redis));
        assert_eq!(
            "Loopback".parse::<TransportKind>(),
            Ok(TransportKind::Loopback)
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_bool_parsing_falls_back_to_default() {
        assert!(bool_var("KVGUARD_TEST_UNSET_BOOL", true));
        assert!(!bool_var("KVGUARD_TEST_UNSET_BOOL", false));
    }

    #[test]
    fn test_persistence_check_toggle() {
        let config = Config {
            health_check_persistence: true,
            ..Config::from_env()
        };
        let store = config.into_store_config();
        assert!(store.health.is_enabled(CheckKind::Persistence));
    }
}

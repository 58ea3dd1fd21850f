//! Helpers shared by the async tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kvguard_core::StoreConfig;

use crate::context::KvGuard;
use crate::transport::{LoopbackServer, LoopbackTransport};

/// Config with fast reconnects and background timers pushed out of the way.
pub fn test_config() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.key_prefix = "test".to_string();
    config.connection.connect_timeout = Duration::from_millis(500);
    config.connection.command_timeout = Duration::from_millis(500);
    config.connection.retry_base = Duration::from_millis(10);
    config.connection.retry_max_delay = Duration::from_millis(50);
    config.connection.max_retries = 1000;
    config.connection.ping_interval = Duration::from_secs(3600);
    config.fallback.sweep_interval = Duration::from_secs(3600);
    config.fallback.sync_interval = Duration::from_secs(3600);
    config.health.interval = Duration::from_secs(3600);
    config
}

/// Polls `check` every 10ms for up to 5s.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Async variant of [`eventually`].
pub async fn eventually_async<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Starts a guard on a fresh loopback server.
pub async fn start_guard() -> (Arc<LoopbackServer>, KvGuard) {
    start_guard_with(test_config()).await
}

pub async fn start_guard_with(config: StoreConfig) -> (Arc<LoopbackServer>, KvGuard) {
    let server = LoopbackServer::new();
    let guard = guard_on(&server, config).await;
    (server, guard)
}

/// Starts another guard sharing `server`, as a second process would.
pub async fn guard_on(server: &Arc<LoopbackServer>, config: StoreConfig) -> KvGuard {
    let transport = Arc::new(LoopbackTransport::new(Arc::clone(server)));
    KvGuard::start(config, transport)
        .await
        .expect("test config is valid")
}

//! The substrate's context object.
//!
//! Built once at process start and handed to consumers. Owns every component
//! and the background tasks that keep them in sync.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use kvguard_core::connection::Transport;
use kvguard_core::health::HealthReport;
use kvguard_core::{BackendEvent, Result, StoreConfig};

use crate::cache::CacheStore;
use crate::connection::ConnectionManager;
use crate::fallback::FallbackCoordinator;
use crate::health::HealthDiagnostics;
use crate::memory::MemoryStore;
use crate::pubsub::PubSubBroker;
use crate::session::SessionStore;
use crate::tasks::TaskScheduler;
use crate::tiered::TieredStore;

/// Capacity of the backend event channel.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Handle to a running substrate. Cheap to clone.
#[derive(Clone)]
pub struct KvGuard {
    config: Arc<StoreConfig>,
    events: broadcast::Sender<BackendEvent>,
    connection: Arc<ConnectionManager>,
    fallback: Arc<FallbackCoordinator>,
    tiered: Arc<TieredStore>,
    cache: Arc<CacheStore>,
    sessions: Arc<SessionStore>,
    pubsub: Arc<PubSubBroker>,
    health: Arc<HealthDiagnostics>,
    scheduler: Arc<TaskScheduler>,
    closed: Arc<AtomicBool>,
}

impl KvGuard {
    /// Builds every component, starts the background tasks and connects.
    ///
    /// An unreachable primary is not an error: the substrate starts in
    /// fallback mode and keeps reconnecting.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before anything is built
    /// * `transport` - Wire access to the primary backend
    ///
    /// # Errors
    ///
    /// Returns `KvError::Configuration` when `config` is invalid.
    pub async fn start(config: StoreConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let scheduler = Arc::new(TaskScheduler::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let prefix = config.key_prefix.clone();

        let connection = ConnectionManager::new(
            transport,
            config.connection.clone(),
            events.clone(),
            scheduler.shutdown_signal(),
        );
        let memory = Arc::new(MemoryStore::new(config.fallback.max_memory_bytes));
        let fallback = FallbackCoordinator::new(
            Arc::clone(&connection),
            memory,
            config.fallback.clone(),
            events.clone(),
            Arc::clone(&scheduler),
        );
        let tiered = Arc::new(TieredStore::new(
            Arc::clone(&connection),
            Arc::clone(&fallback),
        ));
        let cache = Arc::new(CacheStore::new(
            Arc::clone(&tiered),
            config.cache.clone(),
            prefix.as_str(),
        ));
        let sessions = Arc::new(SessionStore::new(
            Arc::clone(&tiered),
            prefix.as_str(),
            config.session.default_ttl_seconds,
        ));
        let pubsub = Arc::new(PubSubBroker::new(
            Arc::clone(&connection),
            Arc::clone(&tiered),
            prefix.as_str(),
            config.pubsub.buffer_size,
        ));
        let health = Arc::new(HealthDiagnostics::new(
            Arc::clone(&connection),
            Arc::clone(&fallback),
            Arc::clone(&cache),
            Arc::clone(&sessions),
            Arc::clone(&pubsub),
            config.health.clone(),
            prefix.as_str(),
        ));

        let guard = Self {
            config: Arc::new(config),
            events,
            connection,
            fallback,
            tiered,
            cache,
            sessions,
            pubsub,
            health,
            scheduler,
            closed: Arc::new(AtomicBool::new(false)),
        };

        // Listeners subscribe before the first connect so no event is missed.
        guard.spawn_listeners();
        guard.spawn_timers();

        if !guard.connection.connect().await {
            tracing::warn!(
                transport = guard.connection.transport_name(),
                "Primary backend unreachable at startup, serving from memory"
            );
        }
        tracing::info!(
            prefix = %guard.config.key_prefix,
            transport = guard.connection.transport_name(),
            mode = guard.fallback.mode().as_str(),
            "kvguard started"
        );
        Ok(guard)
    }

    fn spawn_listeners(&self) {
        let fallback = Arc::clone(&self.fallback);
        self.scheduler
            .spawn_listener("fallback-events", self.events.subscribe(), move |event| {
                let fallback = Arc::clone(&fallback);
                async move { fallback.handle_event(event).await }
            });

        let pubsub = Arc::clone(&self.pubsub);
        self.scheduler
            .spawn_listener("pubsub-events", self.events.subscribe(), move |event| {
                let pubsub = Arc::clone(&pubsub);
                async move {
                    match event {
                        BackendEvent::Connected => pubsub.on_connected().await,
                        BackendEvent::Disconnected { .. } => pubsub.on_disconnected(),
                        _ => {}
                    }
                }
            });

        if let Some(mut remote) = self.pubsub.take_remote_receiver() {
            let pubsub = Arc::clone(&self.pubsub);
            self.scheduler.spawn("pubsub-remote", async move {
                while let Some(message) = remote.recv().await {
                    pubsub.handle_remote(message);
                }
            });
        }
    }

    fn spawn_timers(&self) {
        let connection = Arc::clone(&self.connection);
        self.scheduler.spawn_periodic(
            "liveness-probe",
            self.config.connection.ping_interval,
            move || {
                let connection = Arc::clone(&connection);
                async move { connection.probe().await }
            },
        );

        let fallback = Arc::clone(&self.fallback);
        self.scheduler.spawn_periodic(
            "expiry-sweep",
            self.config.fallback.sweep_interval,
            move || {
                let fallback = Arc::clone(&fallback);
                async move { fallback.sweep().await }
            },
        );

        let fallback = Arc::clone(&self.fallback);
        self.scheduler.spawn_periodic(
            "auto-sync",
            self.config.fallback.sync_interval,
            move || {
                let fallback = Arc::clone(&fallback);
                async move { fallback.sync().await }
            },
        );

        let health = Arc::clone(&self.health);
        self.scheduler
            .spawn_periodic("health", self.config.health.interval, move || {
                let health = Arc::clone(&health);
                async move { health.tick().await }
            });
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Subscribes to backend lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn fallback(&self) -> &Arc<FallbackCoordinator> {
        &self.fallback
    }

    pub fn tiered(&self) -> &Arc<TieredStore> {
        &self.tiered
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn pubsub(&self) -> &Arc<PubSubBroker> {
        &self.pubsub
    }

    pub fn health(&self) -> &Arc<HealthDiagnostics> {
        &self.health
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Runs the health checks now.
    pub async fn status(&self) -> HealthReport {
        self.health.run_checks().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tears the substrate down. Later calls do nothing.
    ///
    /// Timers and listeners stop first, then queued writes get one last
    /// replay, then connections close and in-process state is dropped.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down kvguard");
        self.scheduler.stop_all().await;

        let pending = self.fallback.queue_len().await;
        if pending > 0 && !self.fallback.is_persistent() {
            if !self.connection.is_available() {
                self.connection.reconnect().await;
            }
            let replayed = self.fallback.reconcile_now().await;
            if replayed < pending {
                tracing::warn!(
                    pending,
                    replayed,
                    "Shutting down with writes the primary never received"
                );
            }
        }

        self.connection.shutdown().await;
        self.fallback.memory().clear().await;
        self.pubsub.clear();
        tracing::info!("kvguard stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually_async, start_guard, start_guard_with, test_config};
    use crate::transport::{LoopbackServer, LoopbackTransport};
    use kvguard_core::cache::CacheOptions;
    use kvguard_core::connection::Command;
    use kvguard_core::fallback::FallbackMode;
    use kvguard_core::KvError;
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn wait_reconciled(guard: &KvGuard) -> bool {
        let fallback = guard.fallback();
        eventually_async(move || async move {
            fallback.mode() == FallbackMode::PrimaryUp && fallback.queue_len().await == 0
        })
        .await
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.key_prefix = "bad:".to_string();
        let transport = Arc::new(LoopbackTransport::new(LoopbackServer::new()));
        let result = KvGuard::start(config, transport).await;
        assert!(matches!(result, Err(KvError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_session_abc_scenario() {
        let (server, guard) = start_guard().await;
        let cache = guard.cache();
        let opts = CacheOptions::new().with_ttl(60);

        assert!(cache.set("session:abc", &json!({"ownerId": "u1"}), &opts).await);
        assert_eq!(
            cache.get::<Value>("session:abc", &opts).await,
            Some(json!({"ownerId": "u1"}))
        );

        server.set_available(false);
        assert_eq!(
            cache.get::<Value>("session:abc", &opts).await,
            Some(json!({"ownerId": "u1"}))
        );

        server.set_available(true);
        assert!(wait_reconciled(&guard).await);
        assert!(server.contains_key("test:session:abc"));
    }

    #[tokio::test]
    async fn test_reconciles_writes_made_during_outage() {
        let (server, guard) = start_guard().await;
        let cache = guard.cache();
        let opts = CacheOptions::default();

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        for i in 0..25 {
            assert!(cache.set(&format!("k{}", i), &i, &opts).await);
        }
        assert!(cache.delete("k0", &opts).await);
        assert_eq!(guard.fallback().queue_len().await, 26);

        let mut events = guard.events();
        server.set_available(true);
        assert!(wait_reconciled(&guard).await);
        for i in 1..25 {
            assert!(server.contains_key(&format!("test:k{}", i)));
        }
        assert!(!server.contains_key("test:k0"));
        assert_eq!(cache.get::<i32>("k24", &opts).await, Some(24));

        let replayed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(BackendEvent::Reconciled { replayed }) => return replayed,
                    Ok(_) => continue,
                    Err(_) => return 0,
                }
            }
        })
        .await;
        assert_eq!(replayed.ok(), Some(26));
    }

    #[tokio::test]
    async fn test_starts_in_fallback_when_primary_down() {
        let server = LoopbackServer::new();
        server.set_available(false);
        let transport = Arc::new(LoopbackTransport::new(Arc::clone(&server)));
        let guard = KvGuard::start(test_config(), transport).await.unwrap();

        assert!(!guard.connection().is_available());
        let fallback = guard.fallback();
        assert!(eventually_async(move || async move { fallback.mode() == FallbackMode::Degraded }).await);
        assert!(guard.cache().set("k", &1, &CacheOptions::default()).await);

        server.set_available(true);
        assert!(wait_reconciled(&guard).await);
        assert!(server.contains_key("test:k"));
    }

    #[tokio::test]
    async fn test_liveness_probe_detects_outage() {
        let mut config = test_config();
        config.connection.ping_interval = Duration::from_millis(20);
        let (server, guard) = start_guard_with(config).await;
        let mut events = guard.events();

        server.set_available(false);
        let fallback = guard.fallback();
        assert!(eventually_async(move || async move { fallback.mode() == FallbackMode::Degraded }).await);
        assert!(matches!(
            events.recv().await.unwrap(),
            BackendEvent::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue_and_is_idempotent() {
        let mut config = test_config();
        config.connection.retry_base = Duration::from_secs(60);
        config.connection.retry_max_delay = Duration::from_secs(60);
        let (server, guard) = start_guard_with(config).await;

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        guard.cache().set("k", &1, &CacheOptions::default()).await;
        server.set_available(true);

        guard.shutdown().await;
        guard.shutdown().await;
        assert!(guard.is_shut_down());
        assert!(server.contains_key("test:k"));
        assert!(!guard.connection().is_available());
        assert_eq!(guard.fallback().memory().usage().await.keys, 0);
    }

    #[tokio::test]
    async fn test_status_reports_all_checks() {
        let (_server, guard) = start_guard().await;
        let report = guard.status().await;
        assert_eq!(report.checks.len(), 7);
        assert_eq!(guard.health().latest(), Some(report));
    }
}

//! Connection manager for the primary backend.
//!
//! The only component that talks to the wire. It tracks availability, runs
//! the reconnect backoff loop, races every command against the command
//! timeout and announces lifecycle transitions on the backend event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};

use kvguard_core::config::ConnectionConfig;
use kvguard_core::connection::{
    Command, ConnectionHealth, ConnectionState, RemoteMessage, Reply, SubscriptionHandle,
    SubscriptionTarget, Transport,
};
use kvguard_core::{BackendEvent, KvError, Result};

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    available: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    /// Set once `Disconnected` was announced for the current outage.
    down_announced: AtomicBool,
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<BackendEvent>,
    shutdown: watch::Receiver<bool>,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Creates a manager. Nothing is connected until [`connect`](Self::connect).
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        events: broadcast::Sender<BackendEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            config,
            available: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            down_announced: AtomicBool::new(false),
            state: RwLock::new(ConnectionState::default()),
            events,
            shutdown,
            this: this.clone(),
        })
    }

    /// Connects unless already connected. On failure the reconnect loop is
    /// started and `false` returned.
    pub async fn connect(&self) -> bool {
        if self.is_available() {
            return true;
        }
        if self.establish().await {
            return true;
        }
        let reason = self.last_error();
        self.mark_unavailable(&reason);
        false
    }

    /// Re-establishes the logical connections now, whatever the current state.
    pub async fn reconnect(&self) -> bool {
        if self.establish().await {
            return true;
        }
        let reason = self.last_error();
        self.mark_unavailable(&reason);
        false
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of the connection lifecycle.
    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribes to backend lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Runs a command, returning the typed failure.
    ///
    /// # Errors
    ///
    /// - `KvError::Connectivity` when the backend is down (the manager is
    ///   then marked unavailable and starts reconnecting)
    /// - `KvError::Timeout` when the command exceeded its budget; connection
    ///   state is left untouched
    /// - `KvError::OperationFailed` when the backend rejected the command
    pub async fn try_execute(&self, command: Command) -> Result<Reply> {
        self.ensure_available()?;
        let name = command.name();
        match tokio::time::timeout(self.config.command_timeout, self.transport.execute(command))
            .await
        {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(self.observe(err)),
            Err(_) => Err(self.timed_out(name)),
        }
    }

    /// Runs a command; any failure is logged and reported as `None`.
    pub async fn execute(&self, command: Command) -> Option<Reply> {
        let name = command.name();
        match self.try_execute(command).await {
            Ok(reply) => Some(reply),
            Err(err) => {
                tracing::debug!(command = name, error = %err, "Command failed");
                None
            }
        }
    }

    /// Runs a batch, replies in command order.
    ///
    /// With auto-pipelining the batch is a single round trip; otherwise the
    /// commands run one after another and the first failure aborts the rest.
    ///
    /// # Errors
    ///
    /// Same as [`try_execute`](Self::try_execute).
    pub async fn try_pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_available()?;

        if !self.config.auto_pipelining {
            let mut replies = Vec::with_capacity(commands.len());
            for command in commands {
                replies.push(self.try_execute(command).await?);
            }
            return Ok(replies);
        }

        match tokio::time::timeout(self.config.command_timeout, self.transport.pipeline(commands))
            .await
        {
            Ok(Ok(replies)) => Ok(replies),
            Ok(Err(err)) => Err(self.observe(err)),
            Err(_) => Err(self.timed_out("PIPELINE")),
        }
    }

    /// Runs a batch; any failure is logged and reported as an empty list.
    pub async fn pipeline(&self, commands: Vec<Command>) -> Vec<Reply> {
        let count = commands.len();
        self.try_pipeline(commands).await.unwrap_or_else(|err| {
            tracing::debug!(commands = count, error = %err, "Pipeline failed");
            Vec::new()
        })
    }

    /// Publishes on the publisher connection.
    ///
    /// # Errors
    ///
    /// Same as [`try_execute`](Self::try_execute).
    pub async fn try_publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.ensure_available()?;
        match tokio::time::timeout(
            self.config.command_timeout,
            self.transport.publish(channel, payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.observe(err)),
            Err(_) => Err(self.timed_out("PUBLISH")),
        }
    }

    /// Opens a remote subscription on a dedicated subscriber connection.
    ///
    /// # Errors
    ///
    /// Same as [`try_execute`](Self::try_execute).
    pub async fn try_subscribe(
        &self,
        target: SubscriptionTarget,
        sink: mpsc::UnboundedSender<RemoteMessage>,
    ) -> Result<SubscriptionHandle> {
        self.ensure_available()?;
        match tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.subscribe(target, sink),
        )
        .await
        {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(err)) => Err(self.observe(err)),
            Err(_) => Err(self.timed_out("SUBSCRIBE")),
        }
    }

    /// Pings the backend and reports the round trip.
    pub async fn health_check(&self) -> ConnectionHealth {
        if !self.is_available() {
            let reason = self
                .state()
                .last_error
                .unwrap_or_else(|| "primary backend unavailable".to_string());
            return ConnectionHealth::down(reason);
        }
        let started = Instant::now();
        match self.try_execute(Command::Ping).await {
            Ok(_) => ConnectionHealth::up(started.elapsed().as_millis() as u64),
            Err(err) => ConnectionHealth::down(err.to_string()),
        }
    }

    /// Liveness probe run on a fixed interval.
    ///
    /// Detects failures the transport did not surface, and restarts the
    /// reconnect loop once it has given up.
    pub async fn probe(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.is_available() {
            return match self.try_execute(Command::Ping).await {
                Ok(_) => Ok(()),
                Err(KvError::Timeout { .. }) => {
                    tracing::warn!("Liveness probe timed out");
                    Ok(())
                }
                Err(err) => Err(err),
            };
        }
        if self.reconnecting.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.establish().await {
            Ok(())
        } else {
            let reason = self.last_error();
            self.schedule_reconnect();
            Err(KvError::Connectivity(reason))
        }
    }

    /// Closes every connection; later calls fail fast.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.available.store(false, Ordering::SeqCst);
        self.transport.close().await;
        self.write_state(|state| {
            state.connected = false;
            state.connecting = false;
        });
        tracing::info!(transport = self.transport.name(), "Connection manager shut down");
    }

    async fn establish(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.write_state(|state| state.connecting = true);

        let result =
            match tokio::time::timeout(self.config.connect_timeout, self.transport.connect()).await
            {
                Ok(result) => result,
                Err(_) => Err(KvError::timeout(
                    "CONNECT",
                    self.config.connect_timeout.as_millis() as u64,
                )),
            };

        match result {
            Ok(()) => {
                self.write_state(|state| state.mark_connected(Utc::now()));
                self.apply_runtime_config().await;
                let was_available = self.available.swap(true, Ordering::SeqCst);
                self.down_announced.store(false, Ordering::SeqCst);
                if !was_available {
                    tracing::info!(transport = self.transport.name(), "Connected to primary backend");
                    let _ = self.events.send(BackendEvent::Connected);
                }
                true
            }
            Err(err) => {
                tracing::debug!(error = %err, "Connect attempt failed");
                self.write_state(|state| state.mark_attempt_failed(err.to_string()));
                false
            }
        }
    }

    /// Reapplies runtime settings after every connect. Failures are only logged.
    async fn apply_runtime_config(&self) {
        let Some(policy) = &self.config.eviction_policy else {
            return;
        };
        let command = Command::ConfigSet {
            parameter: "maxmemory-policy".to_string(),
            value: policy.clone(),
        };
        match tokio::time::timeout(self.config.command_timeout, self.transport.execute(command))
            .await
        {
            Ok(Ok(_)) => tracing::debug!(policy = %policy, "Applied eviction policy"),
            Ok(Err(err)) => {
                tracing::warn!(policy = %policy, error = %err, "Failed to apply eviction policy")
            }
            Err(_) => tracing::warn!(policy = %policy, "Applying eviction policy timed out"),
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KvError::Connectivity(
                "connection manager is shut down".to_string(),
            ));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(KvError::Connectivity(
                "primary backend unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn observe(&self, err: KvError) -> KvError {
        if err.is_connectivity() {
            self.mark_unavailable(&err.to_string());
        }
        err
    }

    fn timed_out(&self, operation: &str) -> KvError {
        let after_ms = self.config.command_timeout.as_millis() as u64;
        tracing::warn!(operation, after_ms, "Command timed out");
        KvError::timeout(operation, after_ms)
    }

    fn mark_unavailable(&self, reason: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.available.store(false, Ordering::SeqCst);
        self.write_state(|state| state.mark_disconnected(reason));
        if !self.down_announced.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                transport = self.transport.name(),
                reason,
                "Primary backend unavailable"
            );
            let _ = self.events.send(BackendEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
        self.schedule_reconnect();
    }

    /// Starts the backoff loop unless one is already running.
    fn schedule_reconnect(&self) {
        if self.closed.load(Ordering::SeqCst) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let backoff = this.config.backoff();
            let mut attempt = 0;
            let mut connected = false;

            while attempt < this.config.max_retries && !this.closed.load(Ordering::SeqCst) {
                let delay = backoff.delay(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() || this.closed.load(Ordering::SeqCst) {
                    break;
                }
                this.write_state(|state| state.last_reconnect_at = Some(Utc::now()));
                tracing::debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Reconnecting");
                if this.establish().await {
                    connected = true;
                    break;
                }
                attempt += 1;
            }

            if !connected && attempt >= this.config.max_retries {
                tracing::warn!(
                    attempts = attempt,
                    "Giving up reconnecting until the next liveness probe"
                );
            }
            this.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    fn last_error(&self) -> String {
        self.state()
            .last_error
            .unwrap_or_else(|| "connect failed".to_string())
    }

    fn write_state(&self, update: impl FnOnce(&mut ConnectionState)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut state);
    }
}

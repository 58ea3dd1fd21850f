//! Fallback coordinator.
//!
//! Decides per operation whether the primary is authoritative, keeps the
//! queue of writes the primary has not seen yet and replays it once the
//! primary is back.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use kvguard_core::config::FallbackConfig;
use kvguard_core::connection::Command;
use kvguard_core::fallback::{FallbackMode, FallbackQueueEntry, FallbackSignal, QueuedWrite};
use kvguard_core::{BackendEvent, Result};

use crate::connection::ConnectionManager;
use crate::memory::{MemoryStore, Retention};
use crate::tasks::TaskScheduler;

pub struct FallbackCoordinator {
    connection: Arc<ConnectionManager>,
    memory: Arc<MemoryStore>,
    config: FallbackConfig,
    mode: RwLock<FallbackMode>,
    queue: Mutex<VecDeque<FallbackQueueEntry>>,
    /// Held for the whole of a replay so only one runs at a time.
    reconcile_lock: Mutex<()>,
    events: broadcast::Sender<BackendEvent>,
    scheduler: Arc<TaskScheduler>,
    this: Weak<FallbackCoordinator>,
}

impl FallbackCoordinator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        memory: Arc<MemoryStore>,
        config: FallbackConfig,
        events: broadcast::Sender<BackendEvent>,
        scheduler: Arc<TaskScheduler>,
    ) -> Arc<Self> {
        let mode = if config.persistent {
            FallbackMode::Degraded
        } else {
            FallbackMode::PrimaryUp
        };
        Arc::new_cyclic(|this| Self {
            connection,
            memory,
            config,
            mode: RwLock::new(mode),
            queue: Mutex::new(VecDeque::new()),
            reconcile_lock: Mutex::new(()),
            events,
            scheduler,
            this: this.clone(),
        })
    }

    pub fn mode(&self) -> FallbackMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when reads and writes should hit the primary first.
    pub fn primary_authoritative(&self) -> bool {
        self.mode().primary_authoritative() && self.connection.is_available()
    }

    pub fn is_persistent(&self) -> bool {
        self.config.persistent
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Copy of the pending writes, oldest first.
    pub async fn queued(&self) -> Vec<FallbackQueueEntry> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Applies a write to memory, pinned, and queues it for the primary.
    ///
    /// Returns what the memory write reported: for deletes and set removals
    /// whether something was there, otherwise `true`.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Capacity` when memory is full; nothing is queued then.
    pub async fn record_write(&self, key: &str, write: QueuedWrite) -> Result<bool> {
        let mut queue = self.queue.lock().await;
        let applied = self.apply_to_memory(key, &write, Retention::Pinned).await?;
        queue.push_back(FallbackQueueEntry::new(key, write, Utc::now()));
        let queued = queue.len();
        drop(queue);

        tracing::debug!(key = %key, queued, "Write queued for reconciliation");

        // Primary came back between the caller's routing decision and now.
        if self.primary_authoritative() {
            self.spawn_reconcile();
        }
        Ok(applied)
    }

    /// Mirrors a write the primary accepted into memory as an evictable copy.
    ///
    /// Without `mirror_writes` a set drops the stale memory copy instead, and
    /// member adds only touch sets memory already holds. Deletes and member
    /// removals always apply. Never queued, and a full memory store only skips
    /// the copy.
    pub async fn mirror_write(&self, key: &str, write: &QueuedWrite) {
        if !self.config.mirror_writes {
            match write {
                QueuedWrite::Set { .. } => {
                    self.memory.delete(key).await;
                    return;
                }
                QueuedWrite::SetAdd { .. } if !self.memory.exists(key).await => return,
                _ => {}
            }
        }
        if let Err(err) = self.apply_to_memory(key, write, Retention::Evictable).await {
            tracing::debug!(key = %key, error = %err, "Skipped memory mirror");
            self.memory.delete(key).await;
        }
    }

    /// Drops queued writes for `key` that a newer primary write supersedes.
    pub async fn forget_queued(&self, key: &str) {
        let mut queue = self.queue.lock().await;
        if !queue.is_empty() {
            queue.retain(|entry| entry.key != key);
        }
    }

    /// True when the newest queued write for `key` deletes it.
    pub async fn has_pending_delete(&self, key: &str) -> bool {
        self.queue
            .lock()
            .await
            .iter()
            .rev()
            .find(|entry| entry.key == key)
            .is_some_and(|entry| entry.write == QueuedWrite::Delete)
    }

    async fn apply_to_memory(
        &self,
        key: &str,
        write: &QueuedWrite,
        retention: Retention,
    ) -> Result<bool> {
        match write {
            QueuedWrite::Set { value, ttl_seconds } => {
                self.memory
                    .set_with(key, value.clone(), *ttl_seconds, retention)
                    .await?;
                Ok(true)
            }
            QueuedWrite::Delete => Ok(self.memory.delete(key).await),
            QueuedWrite::SetAdd { member } => {
                self.memory.set_add_with(key, member, retention).await?;
                Ok(true)
            }
            QueuedWrite::SetRemove { member } => Ok(self.memory.set_remove(key, member).await),
        }
    }

    /// Reacts to connection lifecycle events.
    pub async fn handle_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::Disconnected { reason } => self.on_primary_down(&reason),
            BackendEvent::Connected => self.on_primary_up().await,
            BackendEvent::FallbackActivated { .. } | BackendEvent::Reconciled { .. } => {}
        }
    }

    pub fn on_primary_down(&self, reason: &str) {
        let (before, after) = self.signal(FallbackSignal::ProbeFailed);
        if before != FallbackMode::Degraded && after == FallbackMode::Degraded {
            tracing::warn!(reason, "Fallback activated, serving from memory");
            let _ = self.events.send(BackendEvent::FallbackActivated {
                reason: reason.to_string(),
            });
        }
    }

    pub async fn on_primary_up(&self) {
        let (_, after) = self.signal(FallbackSignal::ProbeSucceeded);
        if after == FallbackMode::Reconciling {
            tracing::info!("Primary backend recovered, reconciling");
            self.reconcile_now().await;
        }
    }

    /// Replays queued writes against the primary.
    ///
    /// Returns the number of entries replayed. Does nothing when a replay is
    /// already running, the primary is unreachable or fallback is pinned.
    /// Writes queued while the replay runs are picked up before the
    /// coordinator goes back to `PrimaryUp`. Entries leave the queue only
    /// after the primary accepted them, so a failed or cancelled replay keeps
    /// them; a failure also returns the coordinator to `Degraded`.
    pub async fn reconcile_now(&self) -> usize {
        let Ok(_guard) = self.reconcile_lock.try_lock() else {
            return 0;
        };
        if self.config.persistent || !self.connection.is_available() {
            return 0;
        }
        if self.mode() == FallbackMode::Degraded {
            self.signal(FallbackSignal::ProbeSucceeded);
        }

        let mut replayed = 0;
        loop {
            let batch: Vec<FallbackQueueEntry> = {
                let queue = self.queue.lock().await;
                if queue.is_empty() {
                    self.signal(FallbackSignal::QueueDrained);
                    // The primary now holds everything memory was keeping for it.
                    self.memory.release_all().await;
                    break;
                }
                queue
                    .iter()
                    .take(self.config.replay_batch_size)
                    .cloned()
                    .collect()
            };

            let now = Utc::now();
            let commands: Vec<Command> = batch
                .iter()
                .filter_map(|entry| entry.to_command(now))
                .collect();
            let sent = commands.len();
            if sent > 0 {
                if let Err(err) = self.connection.try_pipeline(commands).await {
                    let pending = self.queue_len().await;
                    self.signal(FallbackSignal::ReplayFailed);
                    tracing::warn!(error = %err, pending, replayed, "Reconciliation failed");
                    return replayed;
                }
            }
            self.retire(&batch).await;
            replayed += sent;
        }

        if replayed > 0 {
            tracing::info!(replayed, "Reconciled queued writes with primary");
            let _ = self.events.send(BackendEvent::Reconciled { replayed });
        }
        replayed
    }

    /// Auto-sync body: replays when writes are pending and the primary is up.
    pub async fn sync(&self) -> Result<()> {
        if self.queue_len().await > 0 && self.connection.is_available() {
            self.reconcile_now().await;
        }
        Ok(())
    }

    /// Expiry sweep body.
    pub async fn sweep(&self) -> Result<()> {
        let removed = self.memory.sweep_expired().await;
        if removed > 0 {
            tracing::debug!(removed, "Swept expired fallback entries");
        }
        Ok(())
    }

    /// Removes replayed entries from the front of the queue. Entries a newer
    /// primary write already superseded are gone and are skipped.
    async fn retire(&self, batch: &[FallbackQueueEntry]) {
        let mut queue = self.queue.lock().await;
        for entry in batch {
            if queue.front() == Some(entry) {
                queue.pop_front();
            }
        }
    }

    fn spawn_reconcile(&self) {
        if let Some(this) = self.this.upgrade() {
            self.scheduler.spawn("reconcile", async move {
                this.reconcile_now().await;
            });
        }
    }

    /// Feeds `signal` to the state machine, returning the mode before and after.
    fn signal(&self, signal: FallbackSignal) -> (FallbackMode, FallbackMode) {
        let mut mode = self.mode.write().unwrap_or_else(PoisonError::into_inner);
        let before = *mode;
        *mode = before.transition(signal, self.config.persistent);
        if before != *mode {
            tracing::debug!(from = before.as_str(), to = mode.as_str(), "Fallback mode changed");
        }
        (before, *mode)
    }
}

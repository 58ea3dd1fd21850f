//! Background task ownership.
//!
//! Every timer and listener runs as its own tokio task. A shared `watch`
//! flag tells them to stop; [`TaskScheduler::stop_all`] raises it, aborts
//! stragglers and waits for all of them.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use kvguard_core::{BackendEvent, Result};

pub struct TaskScheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// A receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Runs `body` every `period`, first after one full period.
    ///
    /// Errors are logged and the timer keeps going.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, body: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                if let Err(err) = body().await {
                    tracing::warn!(task = name, error = %err, "Background task failed");
                }
            }
            tracing::debug!(task = name, "Background task stopped");
        });
        self.track(name, handle);
    }

    /// Feeds every backend event to `handler`, in order.
    pub fn spawn_listener<F, Fut>(
        &self,
        name: &'static str,
        mut events: broadcast::Receiver<BackendEvent>,
        handler: F,
    ) where
        F: Fn(BackendEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.changed() => break,
                };
                match event {
                    Ok(event) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        handler(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(task = name, skipped, "Event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!(task = name, "Event listener stopped");
        });
        self.track(name, handle);
    }

    /// Runs `future` until it finishes or shutdown begins.
    pub fn spawn<Fut>(&self, name: &'static str, future: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = future => {}
                _ = shutdown.changed() => {}
            }
            tracing::debug!(task = name, "Task stopped");
        });
        self.track(name, handle);
    }

    /// Signals shutdown and waits for every task to finish.
    pub async fn stop_all(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<(&'static str, JoinHandle<()>)> = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (name, mut handle) in handles {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(task = name, "Task did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    /// Number of tasks not yet finished.
    pub fn active(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        if self.is_shutting_down() {
            handle.abort();
            return;
        }
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|(_, handle)| !handle.is_finished());
        handles.push((name, handle));
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for (_, handle) in self
            .handles
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}

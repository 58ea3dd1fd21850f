//! Composite health diagnostics.
//!
//! Runs the seven checks concurrently, each bounded by the check timeout, and
//! keeps a rolling history of reports. Observes every component but mutates
//! nothing except the throwaway probe key.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use kvguard_core::cache::health_probe_key;
use kvguard_core::config::HealthConfig;
use kvguard_core::connection::{Command, Reply};
use kvguard_core::health::{
    evaluate_hit_rate, evaluate_latency, evaluate_memory, evaluate_persistence, evaluate_pubsub,
    evaluate_sessions, parse_info, CheckKind, CheckResult, HealthReport, OverallStatus,
};

use crate::cache::CacheStore;
use crate::connection::ConnectionManager;
use crate::fallback::FallbackCoordinator;
use crate::pubsub::PubSubBroker;
use crate::session::SessionStore;

const PRIMARY_DOWN: &str = "Primary backend unavailable";

pub struct HealthDiagnostics {
    connection: Arc<ConnectionManager>,
    fallback: Arc<FallbackCoordinator>,
    cache: Arc<CacheStore>,
    sessions: Arc<SessionStore>,
    pubsub: Arc<PubSubBroker>,
    config: HealthConfig,
    key_prefix: String,
    history: Mutex<VecDeque<HealthReport>>,
    /// Broker drop total seen by the previous pub/sub check.
    seen_dropped: AtomicU64,
}

impl HealthDiagnostics {
    pub fn new(
        connection: Arc<ConnectionManager>,
        fallback: Arc<FallbackCoordinator>,
        cache: Arc<CacheStore>,
        sessions: Arc<SessionStore>,
        pubsub: Arc<PubSubBroker>,
        config: HealthConfig,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            fallback,
            cache,
            sessions,
            pubsub,
            config,
            key_prefix: key_prefix.into(),
            history: Mutex::new(VecDeque::new()),
            seen_dropped: AtomicU64::new(0),
        }
    }

    /// Runs every check and records the report in the history.
    pub async fn run_checks(&self) -> HealthReport {
        let started = Instant::now();
        let (connectivity, performance, memory, persistence, pubsub, cache, sessions) = tokio::join!(
            self.guarded(CheckKind::Connectivity, self.check_connectivity()),
            self.guarded(CheckKind::Performance, self.check_performance()),
            self.guarded(CheckKind::Memory, self.check_memory()),
            self.guarded(CheckKind::Persistence, self.check_persistence()),
            self.guarded(CheckKind::PubSub, async { self.check_pubsub() }),
            self.guarded(CheckKind::Cache, async {
                evaluate_hit_rate(&self.cache.stats(), &self.config.thresholds)
            }),
            self.guarded(CheckKind::Sessions, async {
                evaluate_sessions(&self.sessions.stats().await)
            }),
        );

        let checks = vec![
            connectivity,
            performance,
            memory,
            persistence,
            pubsub,
            cache,
            sessions,
        ];
        let report = HealthReport::from_checks(checks, Utc::now())
            .with_duration(started.elapsed().as_millis() as u64);
        self.record(report.clone());
        report
    }

    /// Most recent report, if any checks ran yet.
    pub fn latest(&self) -> Option<HealthReport> {
        self.lock_history().back().cloned()
    }

    /// Reports oldest first, at most `history_size` of them.
    pub fn history(&self) -> Vec<HealthReport> {
        self.lock_history().iter().cloned().collect()
    }

    /// Periodic timer body: runs the checks and logs the verdict.
    pub async fn tick(&self) -> kvguard_core::Result<()> {
        let report = self.run_checks().await;
        match report.status {
            OverallStatus::Healthy => tracing::info!(
                status = report.status.as_str(),
                duration_ms = report.duration_ms,
                "Health check completed"
            ),
            _ => tracing::warn!(
                status = report.status.as_str(),
                duration_ms = report.duration_ms,
                recommendations = ?report.recommendations,
                "Health check completed"
            ),
        }
        Ok(())
    }

    async fn guarded(
        &self,
        kind: CheckKind,
        check: impl Future<Output = CheckResult>,
    ) -> CheckResult {
        if !self.config.is_enabled(kind) {
            return CheckResult::skipped(kind);
        }
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.check_timeout, check).await {
            Ok(result) => result,
            Err(_) => CheckResult::fail(
                kind,
                format!(
                    "Check timed out after {}ms",
                    self.config.check_timeout.as_millis()
                ),
            ),
        };
        result.with_duration(started.elapsed().as_millis() as u64)
    }

    async fn check_connectivity(&self) -> CheckResult {
        let health = self.connection.health_check().await;
        match (health.healthy, health.latency_ms) {
            (true, Some(latency_ms)) => {
                evaluate_latency(CheckKind::Connectivity, latency_ms, &self.config.thresholds)
            }
            _ => CheckResult::fail(
                CheckKind::Connectivity,
                health.error.unwrap_or_else(|| PRIMARY_DOWN.to_string()),
            ),
        }
    }

    async fn check_performance(&self) -> CheckResult {
        if !self.connection.is_available() {
            return CheckResult::fail(CheckKind::Performance, PRIMARY_DOWN);
        }
        let key = health_probe_key(&self.key_prefix, Uuid::new_v4());
        let value = Utc::now().to_rfc3339().into_bytes();
        let started = Instant::now();

        let round_trip = async {
            self.connection
                .try_execute(Command::set(key.as_str(), value.clone(), Some(60)))
                .await?;
            let reply = self.connection.try_execute(Command::get(key.as_str())).await?;
            self.connection.try_execute(Command::del(key.as_str())).await?;
            Ok::<Reply, kvguard_core::KvError>(reply)
        };

        match round_trip.await {
            Ok(reply) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                if reply.into_bytes().as_deref() == Some(value.as_slice()) {
                    evaluate_latency(CheckKind::Performance, elapsed_ms, &self.config.thresholds)
                } else {
                    CheckResult::fail(CheckKind::Performance, "Probe value did not round trip")
                }
            }
            Err(err) => CheckResult::fail(CheckKind::Performance, err.to_string()),
        }
    }

    async fn check_memory(&self) -> CheckResult {
        let info = match self.connection.try_execute(Command::info("memory")).await {
            Ok(reply) => parse_info(&reply.into_text().unwrap_or_default()),
            Err(err) => return CheckResult::fail(CheckKind::Memory, err.to_string()),
        };
        let usage = self.fallback.memory().usage().await;
        evaluate_memory(
            &info,
            usage.pinned_bytes(),
            usage.max_bytes,
            &self.config.thresholds,
        )
    }

    fn check_pubsub(&self) -> CheckResult {
        let summary = self.pubsub.stats();
        let previous = self.seen_dropped.swap(summary.dropped, Ordering::Relaxed);
        evaluate_pubsub(
            &summary,
            summary.dropped.saturating_sub(previous),
            self.connection.is_available(),
        )
    }

    async fn check_persistence(&self) -> CheckResult {
        match self.connection.try_execute(Command::info("persistence")).await {
            Ok(reply) => evaluate_persistence(
                &parse_info(&reply.into_text().unwrap_or_default()),
                Utc::now().timestamp(),
                &self.config.thresholds,
            ),
            Err(err) => CheckResult::fail(CheckKind::Persistence, err.to_string()),
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<HealthReport>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, report: HealthReport) {
        let mut history = self.lock_history();
        history.push_back(report);
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, start_guard, start_guard_with, test_config};
    use kvguard_core::health::CheckStatus;
    use kvguard_core::pubsub::PublishOptions;
    use std::time::Duration;

    #[tokio::test]
    async fn test_healthy_when_primary_up() {
        let (_server, guard) = start_guard().await;
        let report = guard.health().run_checks().await;
        assert_eq!(report.status, OverallStatus::Healthy, "{:?}", report.checks);
        assert_eq!(report.checks.len(), 7);
        assert_eq!(
            report.check(CheckKind::Persistence).unwrap().message,
            "skipped"
        );
    }

    #[tokio::test]
    async fn test_unhealthy_when_primary_down() {
        let (server, guard) = start_guard().await;
        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        let report = guard.health().run_checks().await;
        assert_eq!(report.status, OverallStatus::Unhealthy);
        assert_eq!(
            report.check(CheckKind::Connectivity).unwrap().status,
            CheckStatus::Fail
        );
        assert_eq!(
            report.check(CheckKind::PubSub).unwrap().status,
            CheckStatus::Fail
        );
        assert!(report
            .recommendations
            .iter()
            .any(|advice| advice.contains("local subscribers only")));
        assert_eq!(
            report.check(CheckKind::Cache).unwrap().status,
            CheckStatus::Pass
        );
        assert!(!report.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_slow_check_times_out_alone() {
        let mut config = test_config();
        config.health.check_timeout = Duration::from_millis(100);
        let (server, guard) = start_guard_with(config).await;
        server.set_latency(Duration::from_millis(300));

        let started = Instant::now();
        let report = guard.health().run_checks().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            report.check(CheckKind::Performance).unwrap().status,
            CheckStatus::Fail
        );
        assert_eq!(
            report.check(CheckKind::PubSub).unwrap().status,
            CheckStatus::Pass
        );
    }

    #[tokio::test]
    async fn test_dropped_messages_warn_once() {
        let mut config = test_config();
        config.pubsub.buffer_size = 1;
        let (server, guard) = start_guard_with(config).await;
        let broker = guard.pubsub();

        server.set_available(false);
        guard.connection().execute(Command::Ping).await;
        broker.publish("c", &1, &PublishOptions::default()).await;
        broker.publish("c", &2, &PublishOptions::default()).await;
        server.set_available(true);
        assert!(eventually(|| broker.stats().buffered == 0).await);

        let pubsub = guard.health().run_checks().await;
        let pubsub = pubsub.check(CheckKind::PubSub).unwrap();
        assert_eq!(pubsub.status, CheckStatus::Warn);
        assert!(pubsub.message.contains("dropped"));

        let report = guard.health().run_checks().await;
        assert_eq!(
            report.check(CheckKind::PubSub).unwrap().status,
            CheckStatus::Pass
        );
        assert_eq!(broker.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_persistence_check_when_enabled() {
        let mut config = test_config();
        config.health.disabled.clear();
        let (_server, guard) = start_guard_with(config).await;
        let report = guard.health().run_checks().await;
        let persistence = report.check(CheckKind::Persistence).unwrap();
        assert_eq!(persistence.status, CheckStatus::Pass);
        assert_ne!(persistence.message, "skipped");
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut config = test_config();
        config.health.history_size = 2;
        let (_server, guard) = start_guard_with(config).await;
        let health = guard.health();
        assert!(health.latest().is_none());

        for _ in 0..3 {
            health.run_checks().await;
        }
        assert_eq!(health.history().len(), 2);
        assert!(health.latest().is_some());
    }

    #[tokio::test]
    async fn test_probe_key_is_cleaned_up() {
        let (server, guard) = start_guard().await;
        guard.health().run_checks().await;
        let leftover = server.handle(Command::Scan {
            pattern: "test:health:*".to_string(),
        });
        assert_eq!(leftover.unwrap(), Reply::Array(Vec::new()));
    }
}

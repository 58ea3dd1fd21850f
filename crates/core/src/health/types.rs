use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::aggregate::{aggregate, recommendations};

/// The independent checks health diagnostics runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Connectivity,
    Performance,
    Memory,
    Persistence,
    PubSub,
    Cache,
    Sessions,
}

impl CheckKind {
    pub const ALL: [CheckKind; 7] = [
        CheckKind::Connectivity,
        CheckKind::Performance,
        CheckKind::Memory,
        CheckKind::Persistence,
        CheckKind::PubSub,
        CheckKind::Cache,
        CheckKind::Sessions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::Connectivity => "connectivity",
            CheckKind::Performance => "performance",
            CheckKind::Memory => "memory",
            CheckKind::Persistence => "persistence",
            CheckKind::PubSub => "pubsub",
            CheckKind::Cache => "cache",
            CheckKind::Sessions => "sessions",
        }
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub message: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl CheckResult {
    fn with_status(kind: CheckKind, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            duration_ms: 0,
            details: Value::Null,
        }
    }

    pub fn pass(kind: CheckKind, message: impl Into<String>) -> Self {
        Self::with_status(kind, CheckStatus::Pass, message)
    }

    pub fn warn(kind: CheckKind, message: impl Into<String>) -> Self {
        Self::with_status(kind, CheckStatus::Warn, message)
    }

    pub fn fail(kind: CheckKind, message: impl Into<String>) -> Self {
        Self::with_status(kind, CheckStatus::Fail, message)
    }

    /// Neutral result for a check disabled by configuration.
    pub fn skipped(kind: CheckKind) -> Self {
        Self::pass(kind, "skipped")
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Unhealthy => "unhealthy",
        }
    }
}

/// One composite verdict over a set of check results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub checks: Vec<CheckResult>,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl HealthReport {
    /// Aggregates `checks` into a report.
    pub fn from_checks(checks: Vec<CheckResult>, generated_at: DateTime<Utc>) -> Self {
        Self {
            status: aggregate(&checks),
            recommendations: recommendations(&checks),
            checks,
            generated_at,
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Returns the result of the given check, if it ran.
    pub fn check(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|check| check.kind == kind)
    }
}

/// Limits the evaluators compare measurements against.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub latency_warn_ms: u64,
    pub latency_fail_ms: u64,
    /// used/max ratio above which memory warns.
    pub memory_warn_ratio: f64,
    pub memory_fail_ratio: f64,
    pub fragmentation_warn_ratio: f64,
    /// Seconds since the last snapshot above which persistence warns.
    pub snapshot_max_age_seconds: u64,
    pub hit_rate_warn: f64,
    /// Lookups required before the hit rate is judged.
    pub hit_rate_min_lookups: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            latency_warn_ms: 100,
            latency_fail_ms: 1000,
            memory_warn_ratio: 0.8,
            memory_fail_ratio: 0.95,
            fragmentation_warn_ratio: 1.5,
            snapshot_max_age_seconds: 3600,
            hit_rate_warn: 0.5,
            hit_rate_min_lookups: 10,
        }
    }
}

//! Pure check evaluators.
//!
//! Each takes measurements gathered by the shell and returns a
//! [`CheckResult`] without a duration; the caller stamps the time it spent.

use serde_json::json;

use super::info::{info_number, InfoMap};
use super::types::{CheckKind, CheckResult, HealthThresholds};
use crate::cache::CacheStats;
use crate::pubsub::BrokerSummary;
use crate::session::SessionStats;

/// Grades a round-trip latency for `kind`.
pub fn evaluate_latency(
    kind: CheckKind,
    latency_ms: u64,
    thresholds: &HealthThresholds,
) -> CheckResult {
    let details = json!({ "latency_ms": latency_ms });
    let result = if latency_ms >= thresholds.latency_fail_ms {
        CheckResult::fail(kind, format!("Round trip took {}ms", latency_ms))
    } else if latency_ms >= thresholds.latency_warn_ms {
        CheckResult::warn(kind, format!("Round trip took {}ms", latency_ms))
    } else {
        CheckResult::pass(kind, format!("Round trip took {}ms", latency_ms))
    };
    result.with_details(details)
}

/// Grades primary memory (from `INFO memory`) and the fallback byte budget.
///
/// A `maxmemory` of zero means the primary is unbounded, so only
/// fragmentation is judged for it.
pub fn evaluate_memory(
    info: &InfoMap,
    fallback_used: usize,
    fallback_max: usize,
    thresholds: &HealthThresholds,
) -> CheckResult {
    let used = info_number(info, "used_memory");
    let max = info_number(info, "maxmemory").filter(|max| *max > 0.0);
    let fragmentation = info_number(info, "mem_fragmentation_ratio");
    let primary_ratio = used.zip(max).map(|(used, max)| used / max);
    let fallback_ratio = if fallback_max == 0 {
        0.0
    } else {
        fallback_used as f64 / fallback_max as f64
    };

    let details = json!({
        "used_memory": used,
        "maxmemory": max,
        "usage_ratio": primary_ratio,
        "fragmentation_ratio": fragmentation,
        "fallback_used_bytes": fallback_used,
        "fallback_max_bytes": fallback_max,
        "fallback_usage_ratio": fallback_ratio,
    });

    let worst = primary_ratio.unwrap_or(0.0).max(fallback_ratio);
    let result = if worst >= thresholds.memory_fail_ratio {
        CheckResult::fail(
            CheckKind::Memory,
            format!("Memory usage at {:.0}% of limit", worst * 100.0),
        )
    } else if worst >= thresholds.memory_warn_ratio {
        CheckResult::warn(
            CheckKind::Memory,
            format!("Memory usage at {:.0}% of limit", worst * 100.0),
        )
    } else if fragmentation.is_some_and(|ratio| ratio >= thresholds.fragmentation_warn_ratio) {
        CheckResult::warn(
            CheckKind::Memory,
            format!(
                "Memory fragmentation ratio is {:.2}",
                fragmentation.unwrap_or_default()
            ),
        )
    } else {
        CheckResult::pass(CheckKind::Memory, "Memory usage within limits")
    };
    result.with_details(details)
}

/// Grades `INFO persistence` at unix time `now_unix`.
pub fn evaluate_persistence(
    info: &InfoMap,
    now_unix: i64,
    thresholds: &HealthThresholds,
) -> CheckResult {
    let bgsave_status = info.get("rdb_last_bgsave_status").map(String::as_str);
    let last_save = info_number(info, "rdb_last_save_time").map(|t| t as i64);
    let age = last_save.map(|t| (now_unix - t).max(0) as u64);
    let details = json!({
        "rdb_last_bgsave_status": bgsave_status,
        "rdb_last_save_time": last_save,
        "last_save_age_seconds": age,
        "aof_enabled": info.get("aof_enabled"),
    });

    let result = match (bgsave_status, age) {
        (Some(status), _) if status != "ok" => CheckResult::fail(
            CheckKind::Persistence,
            format!("Last background save status: {}", status),
        ),
        (_, Some(age)) if age > thresholds.snapshot_max_age_seconds => CheckResult::warn(
            CheckKind::Persistence,
            format!("Last snapshot was {}s ago", age),
        ),
        (_, Some(age)) => {
            CheckResult::pass(CheckKind::Persistence, format!("Last snapshot was {}s ago", age))
        }
        (_, None) => CheckResult::warn(CheckKind::Persistence, "No snapshot information reported"),
    };
    result.with_details(details)
}

/// Grades the cache hit rate once enough lookups were made.
pub fn evaluate_hit_rate(stats: &CacheStats, thresholds: &HealthThresholds) -> CheckResult {
    let details = json!({
        "hits": stats.hits,
        "misses": stats.misses,
        "sets": stats.sets,
        "deletes": stats.deletes,
        "errors": stats.errors,
        "hit_rate": stats.hit_rate(),
    });

    let result = match stats.hit_rate() {
        Some(rate) if stats.lookups() >= thresholds.hit_rate_min_lookups => {
            let message = format!("Hit rate {:.1}%", rate * 100.0);
            if rate < thresholds.hit_rate_warn {
                CheckResult::warn(CheckKind::Cache, message)
            } else {
                CheckResult::pass(CheckKind::Cache, message)
            }
        }
        _ => CheckResult::pass(CheckKind::Cache, "Not enough lookups to judge hit rate"),
    };
    result.with_details(details)
}

/// Grades the broker.
///
/// Without the primary, messages reach local subscribers only and the check
/// fails. `newly_dropped` counts messages dropped since the previous check;
/// any warns, as do messages still buffered.
pub fn evaluate_pubsub(
    summary: &BrokerSummary,
    newly_dropped: u64,
    primary_available: bool,
) -> CheckResult {
    let details = json!({
        "channels": summary.channels,
        "patterns": summary.patterns,
        "subscribers": summary.subscribers,
        "buffered": summary.buffered,
        "dropped": summary.dropped,
        "dropped_since_last_check": newly_dropped,
    });

    let result = if !primary_available {
        CheckResult::fail(
            CheckKind::PubSub,
            format!(
                "Primary unavailable, {} messages buffered for remote delivery",
                summary.buffered
            ),
        )
    } else if newly_dropped > 0 {
        CheckResult::warn(
            CheckKind::PubSub,
            format!("{newly_dropped} buffered messages were dropped"),
        )
    } else if summary.buffered > 0 {
        CheckResult::warn(
            CheckKind::PubSub,
            format!("{} messages waiting for the primary", summary.buffered),
        )
    } else {
        CheckResult::pass(
            CheckKind::PubSub,
            format!(
                "{} channels, {} subscribers",
                summary.channels + summary.patterns,
                summary.subscribers
            ),
        )
    };
    result.with_details(details)
}

/// Reports session counts; sessions held only in memory warn.
pub fn evaluate_sessions(stats: &SessionStats) -> CheckResult {
    let details = json!({
        "total": stats.total,
        "guest": stats.guest,
        "authenticated": stats.authenticated,
        "primary": stats.primary,
        "memory": stats.memory,
    });
    let message = format!(
        "{} active sessions ({} guest, {} authenticated)",
        stats.total, stats.guest, stats.authenticated
    );
    let result = if stats.primary == 0 && stats.memory > 0 {
        CheckResult::warn(CheckKind::Sessions, message)
    } else {
        CheckResult::pass(CheckKind::Sessions, message)
    };
    result.with_details(details)
}

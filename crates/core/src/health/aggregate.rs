use super::types::{CheckKind, CheckResult, CheckStatus, OverallStatus};

/// Folds check results into one status.
///
/// Any failure makes the whole report unhealthy. Without failures, two or
/// more warnings degrade it; a single warning does not.
pub fn aggregate(checks: &[CheckResult]) -> OverallStatus {
    let failed = checks
        .iter()
        .filter(|check| check.status == CheckStatus::Fail)
        .count();
    let warned = checks
        .iter()
        .filter(|check| check.status == CheckStatus::Warn)
        .count();

    if failed > 0 {
        OverallStatus::Unhealthy
    } else if warned > 1 {
        OverallStatus::Degraded
    } else {
        OverallStatus::Healthy
    }
}

/// Returns one advisory line per warning or failing check, in check order.
pub fn recommendations(checks: &[CheckResult]) -> Vec<String> {
    let mut flagged: Vec<&CheckResult> = checks
        .iter()
        .filter(|check| check.status != CheckStatus::Pass)
        .collect();
    flagged.sort_by_key(|check| check.kind);
    flagged.dedup_by_key(|check| check.kind);

    flagged
        .into_iter()
        .map(|check| recommendation(check.kind, check.status).to_string())
        .collect()
}

fn recommendation(kind: CheckKind, status: CheckStatus) -> &'static str {
    match (kind, status) {
        (CheckKind::Connectivity, CheckStatus::Fail) => {
            "Primary backend is unreachable: verify host, port and credentials and check network connectivity"
        }
        (CheckKind::Connectivity, _) => {
            "Primary backend responds slowly to ping: check backend load and network latency"
        }
        (CheckKind::Performance, CheckStatus::Fail) => {
            "Round-trip operations are failing or exceeding the timeout: inspect backend load and slow log"
        }
        (CheckKind::Performance, _) => {
            "Round-trip latency is elevated: check backend load and network round-trip time"
        }
        (CheckKind::Memory, CheckStatus::Fail) => {
            "Memory is nearly exhausted: raise maxmemory, review the eviction policy or shorten key TTLs"
        }
        (CheckKind::Memory, _) => {
            "Memory usage is high: review the eviction policy and key TTLs"
        }
        (CheckKind::Persistence, CheckStatus::Fail) => {
            "Last background save failed: check backend disk space and persistence configuration"
        }
        (CheckKind::Persistence, _) => {
            "Last durable snapshot is old: review the backend save schedule"
        }
        (CheckKind::PubSub, CheckStatus::Fail) => {
            "Pub/sub transport is unavailable: messages are delivered to local subscribers only"
        }
        (CheckKind::PubSub, _) => {
            "Pub/sub messages are being buffered or dropped: check primary availability and buffer size"
        }
        (CheckKind::Cache, _) => "Cache hit rate is low: review TTLs and key patterns",
        (CheckKind::Sessions, _) => {
            "Sessions are served from the fallback store: they will be replayed once the primary recovers"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(kind: CheckKind) -> CheckResult {
        CheckResult::pass(kind, "ok")
    }

    fn warn(kind: CheckKind) -> CheckResult {
        CheckResult::warn(kind, "meh")
    }

    fn fail(kind: CheckKind) -> CheckResult {
        CheckResult::fail(kind, "bad")
    }

    #[test]
    fn test_one_failure_is_unhealthy() {
        let checks = vec![pass(CheckKind::Connectivity), fail(CheckKind::Memory)];
        assert_eq!(aggregate(&checks), OverallStatus::Unhealthy);
    }

    #[test]
    fn test_two_warnings_are_degraded() {
        let checks = vec![
            warn(CheckKind::Cache),
            warn(CheckKind::Memory),
            pass(CheckKind::Connectivity),
        ];
        assert_eq!(aggregate(&checks), OverallStatus::Degraded);
    }

    #[test]
    fn test_single_warning_is_healthy() {
        let checks = vec![warn(CheckKind::Cache), pass(CheckKind::Connectivity)];
        assert_eq!(aggregate(&checks), OverallStatus::Healthy);
    }

    #[test]
    fn test_failure_beats_warnings() {
        let checks = vec![
            warn(CheckKind::Cache),
            warn(CheckKind::Memory),
            fail(CheckKind::Connectivity),
        ];
        assert_eq!(aggregate(&checks), OverallStatus::Unhealthy);
    }

    #[test]
    fn test_no_checks_is_healthy() {
        assert_eq!(aggregate(&[]), OverallStatus::Healthy);
    }

    #[test]
    fn test_recommendations_are_deterministic() {
        let checks = vec![
            warn(CheckKind::Cache),
            pass(CheckKind::Performance),
            fail(CheckKind::Connectivity),
        ];
        let first = recommendations(&checks);
        let mut reversed = checks.clone();
        reversed.reverse();
        assert_eq!(first, recommendations(&reversed));
        assert_eq!(first.len(), 2);
        assert!(first[0].starts_with("Primary backend is unreachable"));
        assert!(first[1].contains("TTLs and key patterns"));
    }

    #[test]
    fn test_pubsub_failure_names_local_only_delivery() {
        let advice = recommendations(&[fail(CheckKind::PubSub)]);
        assert_eq!(advice.len(), 1);
        assert!(advice[0].contains("local subscribers only"));
        let advice = recommendations(&[warn(CheckKind::PubSub)]);
        assert!(advice[0].contains("buffered or dropped"));
    }

    #[test]
    fn test_all_pass_has_no_recommendations() {
        let checks: Vec<_> = CheckKind::ALL.iter().map(|kind| pass(*kind)).collect();
        assert!(recommendations(&checks).is_empty());
    }
}

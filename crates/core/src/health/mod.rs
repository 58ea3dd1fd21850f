mod aggregate;
mod evaluate;
mod info;
mod types;

pub use aggregate::{aggregate, recommendations};
pub use evaluate::{
    evaluate_hit_rate, evaluate_latency, evaluate_memory, evaluate_persistence, evaluate_pubsub,
    evaluate_sessions,
};
pub use info::{info_number, parse_info, InfoMap};
pub use types::{
    CheckKind, CheckResult, CheckStatus, HealthReport, HealthThresholds, OverallStatus,
};

//! Process-wide metrics hook for the resource matcher.
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use crate::types::MatchResult;

/// Metrics observer for record-pair scoring.
pub trait MatchMetrics: Send + Sync {
    fn record_match(&self, resource_type: &str, result: MatchResult, latency: Duration);
}

/// Install or clear the global match metrics recorder.
pub fn set_match_metrics(recorder: Option<Arc<dyn MatchMetrics>>) {
    let mut guard = metrics_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = recorder;
}

fn metrics_lock() -> &'static RwLock<Option<Arc<dyn MatchMetrics>>> {
    static METRICS: OnceLock<RwLock<Option<Arc<dyn MatchMetrics>>>> = OnceLock::new();
    METRICS.get_or_init(|| RwLock::new(None))
}

pub(crate) fn metrics_recorder() -> Option<Arc<dyn MatchMetrics>> {
    let guard = metrics_lock()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.clone()
}

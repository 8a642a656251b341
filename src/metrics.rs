//! Prometheus metrics for the storage engine
//!
//! Counters are process-wide and always updated; [`init_metrics`] registers
//! them with [`METRICS_REGISTRY`] so [`export_metrics`] can render them.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Once;
use tracing::error;

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref COMMITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("minidelta_commits_total", "Commits written, by action kind"),
        &["action"]
    ).expect("valid commits metric");

    pub static ref COMMIT_RETRIES: IntCounter = IntCounter::new(
        "minidelta_commit_retries_total",
        "Commit attempts that lost a version race and were retried"
    ).expect("valid retries metric");

    pub static ref ROWS_SCANNED: IntCounter = IntCounter::new(
        "minidelta_rows_scanned_total",
        "Rows decoded from data files by scans"
    ).expect("valid rows metric");

    pub static ref FILES_READ: IntCounter = IntCounter::new(
        "minidelta_files_read_total",
        "Data files decoded by scans"
    ).expect("valid files read metric");

    pub static ref FILES_PRUNED: IntCounter = IntCounter::new(
        "minidelta_files_pruned_total",
        "Data files skipped by scans using partition values or statistics"
    ).expect("valid files pruned metric");

    pub static ref FILES_VACUUMED: IntCounter = IntCounter::new(
        "minidelta_files_vacuumed_total",
        "Data files physically removed by vacuum"
    ).expect("valid files vacuumed metric");

    pub static ref BYTES_VACUUMED: IntCounter = IntCounter::new(
        "minidelta_bytes_vacuumed_total",
        "Bytes reclaimed by vacuum"
    ).expect("valid bytes vacuumed metric");

    pub static ref IDS_ALLOCATED: IntCounter = IntCounter::new(
        "minidelta_ids_allocated_total",
        "Ids issued by the sequence allocator"
    ).expect("valid ids metric");
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(COMMITS_TOTAL.clone()),
            Box::new(COMMIT_RETRIES.clone()),
            Box::new(ROWS_SCANNED.clone()),
            Box::new(FILES_READ.clone()),
            Box::new(FILES_PRUNED.clone()),
            Box::new(FILES_VACUUMED.clone()),
            Box::new(BYTES_VACUUMED.clone()),
            Box::new(IDS_ALLOCATED.clone()),
        ];
        for collector in collectors {
            if let Err(e) = METRICS_REGISTRY.register(collector) {
                error!("Failed to register metric: {}", e);
            }
        }
    });
}

/// Render registered metrics in the Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_after_init() {
        init_metrics();
        init_metrics();
        IDS_ALLOCATED.inc();
        COMMITS_TOTAL.with_label_values(&["append"]).inc();

        let text = export_metrics();
        assert!(text.contains("minidelta_ids_allocated_total"));
        assert!(text.contains("minidelta_commits_total"));
    }
}

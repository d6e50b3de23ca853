//! Metrics and observability utilities
//!
//! Prometheus metrics for bulk imports, exports and restores with
//! standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all bMINTY metrics
pub const METRICS_PREFIX: &str = "bminty";

/// Buckets for long-running data operations (in seconds)
pub const DURATION_BUCKETS: &[f64] = &[
    0.1,     // 100ms
    0.5,     // 500ms
    1.0,     // 1s
    5.0,     // 5s
    15.0,    // 15s
    60.0,    // 1m
    300.0,   // 5m
    900.0,   // 15m
    3600.0,  // 1h
    14400.0, // 4h
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Import metrics
    describe_counter!(
        format!("{}_import_jobs_total", METRICS_PREFIX),
        Unit::Count,
        "Bulk import jobs by terminal status"
    );

    describe_counter!(
        format!("{}_import_rows_total", METRICS_PREFIX),
        Unit::Count,
        "Import rows by table and outcome"
    );

    describe_histogram!(
        format!("{}_import_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Bulk import wall time in seconds"
    );

    describe_gauge!(
        format!("{}_jobs_tracked", METRICS_PREFIX),
        Unit::Count,
        "Job status documents held in memory"
    );

    // Export metrics
    describe_counter!(
        format!("{}_exports_total", METRICS_PREFIX),
        Unit::Count,
        "Exports by format"
    );

    describe_histogram!(
        format!("{}_export_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Export build time in seconds"
    );

    // Restore metrics
    describe_counter!(
        format!("{}_restores_total", METRICS_PREFIX),
        Unit::Count,
        "Snapshot restores by status"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record row outcomes of one import table
pub fn record_rows(table: &str, outcome: &str, count: u64) {
    if count == 0 {
        return;
    }
    counter!(
        format!("{}_import_rows_total", METRICS_PREFIX),
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(count);
}

/// Helper to record a finished import
pub fn record_import(duration_secs: f64, success: bool) {
    let status = if success { "completed" } else { "failed" };

    counter!(
        format!("{}_import_jobs_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_import_duration_seconds", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

/// Helper to record an export
pub fn record_export(duration_secs: f64, format: &str) {
    counter!(
        format!("{}_exports_total", METRICS_PREFIX),
        "format" => format.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_export_duration_seconds", METRICS_PREFIX),
        "format" => format.to_string()
    )
    .record(duration_secs);
}

/// Helper to publish how many job status documents are held
pub fn record_jobs_tracked(count: usize) {
    gauge!(format!("{}_jobs_tracked", METRICS_PREFIX)).set(count as f64);
}

/// Helper to record a restore attempt
pub fn record_restore(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        format!("{}_restores_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_buckets_sorted() {
        let mut prev = 0.0;
        for &bucket in DURATION_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: calls are no-ops
        record_rows("signal", "inserted", 10);
        record_rows("signal", "skipped", 0);
        record_import(1.5, true);
        record_export(0.2, "zip");
        record_restore(false);
    }
}

//! Prometheus metrics for query jobs.
//!
//! Call [`init`] once at startup to register every metric with [`REGISTRY`].
//! Metrics are updated whether or not they are registered.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Registry holding every quarry job metric
    pub static ref REGISTRY: Registry = Registry::new();

    /// Jobs created by a job store
    pub static ref JOBS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "quarry_jobs_created_total",
        "Total query jobs created"
    ).expect("metric can be created");

    /// Jobs that reached a terminal state, by outcome (done, failed, cancelled)
    pub static ref JOBS_FINISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quarry_jobs_finished_total", "Total query jobs finished"),
        &["outcome"]
    ).expect("metric can be created");

    /// Jobs currently registered in a job store
    pub static ref JOBS_LIVE: IntGauge = IntGauge::new(
        "quarry_jobs_live",
        "Query jobs currently live"
    ).expect("metric can be created");

    /// Result rows written to sinks, header excluded
    pub static ref ROWS_WRITTEN_TOTAL: IntCounter = IntCounter::new(
        "quarry_rows_written_total",
        "Total result rows written"
    ).expect("metric can be created");

    /// Bytes of completed result artifacts
    pub static ref RESULT_BYTES_TOTAL: IntCounter = IntCounter::new(
        "quarry_result_bytes_total",
        "Total bytes of completed result artifacts"
    ).expect("metric can be created");

    /// Result partitions read to completion or abandonment
    pub static ref PARTITIONS_READ_TOTAL: IntCounter = IntCounter::new(
        "quarry_partitions_read_total",
        "Total result partitions read"
    ).expect("metric can be created");
}

pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(JOBS_CREATED_TOTAL.clone()))
            .expect("jobs_created_total can be registered");
        REGISTRY
            .register(Box::new(JOBS_FINISHED_TOTAL.clone()))
            .expect("jobs_finished_total can be registered");
        REGISTRY
            .register(Box::new(JOBS_LIVE.clone()))
            .expect("jobs_live can be registered");
        REGISTRY
            .register(Box::new(ROWS_WRITTEN_TOTAL.clone()))
            .expect("rows_written_total can be registered");
        REGISTRY
            .register(Box::new(RESULT_BYTES_TOTAL.clone()))
            .expect("result_bytes_total can be registered");
        REGISTRY
            .register(Box::new(PARTITIONS_READ_TOTAL.clone()))
            .expect("partitions_read_total can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        JOBS_FINISHED_TOTAL.with_label_values(&["done"]).inc();

        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"quarry_jobs_finished_total".to_string()));
        assert!(names.contains(&"quarry_jobs_live".to_string()));
    }
}

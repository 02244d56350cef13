use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};
use std::sync::LazyLock;

pub static INGEST_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "weft_upload_ingest_total",
        "Ingest requests by outcome",
        &["result"]
    )
    .unwrap()
});

pub static INGEST_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "weft_upload_ingest_bytes_total",
        "Accepted payload bytes"
    )
    .unwrap()
});

pub static INGEST_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "weft_upload_ingest_duration_seconds",
        "Ingest latency in seconds",
        &["result"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0]
    )
    .unwrap()
});

pub static JOB_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "weft_upload_job_runs_total",
        "Pipeline job executions by label and result",
        &["label", "result"]
    )
    .unwrap()
});

pub static JOB_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "weft_upload_job_duration_seconds",
        "Pipeline job latency in seconds",
        &["label"],
        vec![0.01, 0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0]
    )
    .unwrap()
});

pub static QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "weft_upload_queue_depth",
        "Pending jobs per queue label",
        &["label"]
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

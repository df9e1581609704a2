//! Metrics module
//!
//! Provides Prometheus metrics for uploads driven through the bridge.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "putbridge_uploads_total",
        "Total number of uploads",
        &["bucket", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "putbridge_upload_bytes_total",
        "Total bytes materialized into destinations"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "putbridge_upload_duration_seconds",
        "Upload duration in seconds, from worker start to finalize",
        &["bucket"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "putbridge_errors_total",
        "Total upload errors by type",
        &["type"]
    ).unwrap();
}

/// Record a successful upload
pub fn record_upload_success(bucket: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[bucket, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed upload
pub fn record_upload_failure(bucket: &str) {
    UPLOADS_TOTAL.with_label_values(&[bucket, "failure"]).inc();
}

/// Record upload duration
pub fn record_upload_duration(bucket: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[bucket])
        .observe(duration_secs);
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

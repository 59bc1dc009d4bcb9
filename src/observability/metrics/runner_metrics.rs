//! # Runner Metrics
//!
//! Artifact download and runner lifecycle metrics.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec};
use std::sync::LazyLock;

static ARTIFACT_DOWNLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tf_controller_artifact_downloads_total",
        "Total number of verified artifact downloads",
    )
    .expect("Failed to create ARTIFACT_DOWNLOADS_TOTAL metric - this should never happen")
});

static ARTIFACT_DOWNLOAD_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "tf_controller_artifact_download_errors_total",
            "Total number of failed artifact downloads",
        ),
        &["kind"],
    )
    .expect("Failed to create ARTIFACT_DOWNLOAD_ERRORS_TOTAL metric - this should never happen")
});

static ARTIFACT_DOWNLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "tf_controller_artifact_download_duration_seconds",
            "Duration of artifact downloads in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("Failed to create ARTIFACT_DOWNLOAD_DURATION metric - this should never happen")
});

static RUNNER_ACQUISITIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "tf_controller_runner_acquisitions_total",
            "Total number of runner acquisitions by result",
        ),
        &["result"],
    )
    .expect("Failed to create RUNNER_ACQUISITIONS_TOTAL metric - this should never happen")
});

static RUNNER_CLEANUP_TIMEOUTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tf_controller_runner_cleanup_timeouts_total",
        "Total number of runner pods still present when cleanup gave up",
    )
    .expect("Failed to create RUNNER_CLEANUP_TIMEOUTS_TOTAL metric - this should never happen")
});

pub(crate) fn register_runner_metrics() -> Result<()> {
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOADS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOAD_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOAD_DURATION.clone()))?;
    REGISTRY.register(Box::new(RUNNER_ACQUISITIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RUNNER_CLEANUP_TIMEOUTS_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_artifact_downloads() {
    ARTIFACT_DOWNLOADS_TOTAL.inc();
}

pub fn increment_artifact_download_errors(kind: &str) {
    ARTIFACT_DOWNLOAD_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_artifact_download_duration(duration: f64) {
    ARTIFACT_DOWNLOAD_DURATION.observe(duration);
}

pub fn increment_runner_acquisitions(result: &str) {
    RUNNER_ACQUISITIONS_TOTAL.with_label_values(&[result]).inc();
}

pub fn increment_runner_cleanup_timeouts() {
    RUNNER_CLEANUP_TIMEOUTS_TOTAL.inc();
}

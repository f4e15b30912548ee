//! Prometheus metrics for scenario runs
//!
//! Counts verdicts per failure kind and times each phase of a run. The
//! exporter is optional; without it the macros record into a no-op recorder.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::checker::FailureKind;

/// Metric names
pub mod names {
    /// Counter: Scenario runs by result (pass or a failure kind)
    pub const SCENARIOS_TOTAL: &str = "csi_e2e_scenarios_total";
    /// Histogram: Wall-clock duration of a scenario phase in seconds
    pub const PHASE_DURATION_SECONDS: &str = "csi_e2e_phase_duration_seconds";
    /// Gauge: Publish calls observed by the last verified scenario
    pub const LAST_PUBLISH_CALLS: &str = "csi_e2e_last_publish_calls";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a passing scenario
pub fn record_pass(publish_calls: usize) {
    counter!(names::SCENARIOS_TOTAL, "result" => "pass").increment(1);
    gauge!(names::LAST_PUBLISH_CALLS).set(publish_calls as f64);
}

/// Record a failing scenario by kind
pub fn record_failure(kind: FailureKind) {
    counter!(names::SCENARIOS_TOTAL, "result" => kind.as_str()).increment(1);
}

/// Times one phase of a scenario run
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
}

impl PhaseTimer {
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        histogram!(names::PHASE_DURATION_SECONDS, "phase" => self.phase)
            .record(self.start.elapsed().as_secs_f64());
    }
}

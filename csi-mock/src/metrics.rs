//! Metrics for the mock driver
//!
//! Counts every call the mock receives and how long the handler took.
//! Recording is a no-op until a recorder (e.g. the Prometheus exporter) is
//! installed by the binary.

use std::time::Instant;

use metrics::{counter, histogram};

/// Metric names
pub mod names {
    /// Counter: Total number of calls received by method and status
    pub const CSI_MOCK_CALLS_TOTAL: &str = "csi_mock_calls_total";
    /// Histogram: Duration of mock call handling in seconds
    pub const CSI_MOCK_CALL_DURATION_SECONDS: &str = "csi_mock_call_duration_seconds";
    /// Counter: Calls rejected because the call log was sealed
    pub const CSI_MOCK_LATE_CALLS_TOTAL: &str = "csi_mock_late_calls_total";
}

/// Record a handled call with its result
pub fn record_call(method: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_MOCK_CALLS_TOTAL, "method" => method.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_MOCK_CALL_DURATION_SECONDS, "method" => method.to_string())
        .record(duration_secs);
}

/// Record a call that arrived after the log was sealed
pub fn record_late_call(method: &str) {
    counter!(names::CSI_MOCK_LATE_CALLS_TOTAL, "method" => method.to_string()).increment(1);
}

/// Helper for timing calls
pub struct CallTimer {
    method: &'static str,
    start: Instant,
}

impl CallTimer {
    /// Start timing a call
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            start: Instant::now(),
        }
    }

    /// Complete the call with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_call(self.method, "success", duration);
    }

    /// Complete the call with failure
    pub fn failure(self, code: tonic::Code) {
        let duration = self.start.elapsed().as_secs_f64();
        record_call(self.method, &format!("{:?}", code), duration);
    }
}

//! Prometheus metrics for the Runbox sandbox.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::executor::{RunOutcome, RunReport};

/// Label set for run metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RunLabels {
    /// "success" or "error".
    pub status: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// The error kind, as reported by `SandboxError::kind`.
    pub error_kind: String,
}

/// Prometheus metrics for sandbox runs.
pub struct RunboxMetrics {
    /// Total number of runs by final status.
    pub runs_total: Family<RunLabels, Counter>,
    /// Run duration in seconds.
    pub run_duration_seconds: Family<RunLabels, Histogram>,
    /// Total number of failed runs by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
}

impl RunboxMetrics {
    /// Create a new `RunboxMetrics` and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let runs_total = Family::default();
        registry.register("runbox_runs_total", "Total sandbox runs", runs_total.clone());

        let run_duration_seconds = Family::<RunLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter())
        });
        registry.register(
            "runbox_run_duration_seconds",
            "Sandbox run duration",
            run_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "runbox_errors_total",
            "Total failed sandbox runs by kind",
            errors_total.clone(),
        );

        Self {
            runs_total,
            run_duration_seconds,
            errors_total,
        }
    }

    /// Record a finished run.
    pub fn record_run(&self, status: &str, duration_secs: f64) {
        let labels = RunLabels {
            status: status.to_string(),
        };
        self.runs_total.get_or_create(&labels).inc();
        self.run_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed run's kind.
    pub fn record_error(&self, error_kind: &str) {
        let labels = ErrorLabels {
            error_kind: error_kind.to_string(),
        };
        self.errors_total.get_or_create(&labels).inc();
    }

    /// Record everything a report carries.
    pub fn record_report(&self, report: &RunReport) {
        let secs = report.elapsed_ms as f64 / 1000.0;
        match &report.outcome {
            RunOutcome::Success { .. } => self.record_run("success", secs),
            RunOutcome::Error { error } => {
                self.record_run("error", secs);
                self.record_error(error.kind());
            }
        }
    }
}

//! Controller metrics
//!
//! Prometheus collectors for lifecycle operations, owned by an explicit
//! registry so several controller instances can coexist in one process.

use crate::error::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

/// Prometheus collectors for the controller
pub struct ControllerMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
    replays: IntCounterVec,
    resumed_tasks: IntCounterVec,
    lost_tasks: IntCounterVec,
    supervisor_restarts: IntCounter,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "csi_controller_operations_total",
                "CSI controller operations by outcome",
            ),
            &["operation", "outcome"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "csi_controller_operation_duration_seconds",
                "Duration of CSI controller operations",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["operation"],
        )?;
        let replays = IntCounterVec::new(
            Opts::new(
                "csi_controller_ledger_replays_total",
                "Requests answered from a terminal ledger record",
            ),
            &["operation"],
        )?;
        let resumed_tasks = IntCounterVec::new(
            Opts::new(
                "csi_controller_resumed_tasks_total",
                "In-progress backend tasks resumed by a retried request",
            ),
            &["operation"],
        )?;
        let lost_tasks = IntCounterVec::new(
            Opts::new(
                "csi_controller_lost_tasks_total",
                "Backend tasks reported as not found while polling",
            ),
            &["operation"],
        )?;
        let supervisor_restarts = IntCounter::new(
            "csi_controller_supervisor_restarts_total",
            "Background loop relaunches after a failure",
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(replays.clone()))?;
        registry.register(Box::new(resumed_tasks.clone()))?;
        registry.register(Box::new(lost_tasks.clone()))?;
        registry.register(Box::new(supervisor_restarts.clone()))?;

        Ok(Self {
            registry,
            operations,
            duration,
            replays,
            resumed_tasks,
            lost_tasks,
            supervisor_restarts,
        })
    }

    /// Start timing an operation; the duration is observed when the timer drops
    pub fn start_timer(&self, operation: &str) -> HistogramTimer {
        self.duration.with_label_values(&[operation]).start_timer()
    }

    /// Count an operation outcome
    pub fn record<T>(&self, operation: &str, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.code().as_str(),
        };
        self.operations.with_label_values(&[operation, outcome]).inc();
    }

    pub fn record_replay(&self, operation: &str) {
        self.replays.with_label_values(&[operation]).inc();
    }

    pub fn record_resume(&self, operation: &str) {
        self.resumed_tasks.with_label_values(&[operation]).inc();
    }

    pub fn record_lost_task(&self, operation: &str) {
        self.lost_tasks.with_label_values(&[operation]).inc();
    }

    pub fn record_supervisor_restart(&self) {
        self.supervisor_restarts.inc();
    }

    pub fn operation_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations.with_label_values(&[operation, outcome]).get()
    }

    pub fn replay_count(&self, operation: &str) -> u64 {
        self.replays.with_label_values(&[operation]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every collector in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_record_outcomes() {
        let metrics = ControllerMetrics::new().unwrap();

        metrics.record::<()>("CreateVolume", &Ok(()));
        metrics.record::<()>("CreateVolume", &Err(Error::AlreadyExists("dup".into())));
        metrics.record_replay("CreateVolume");

        assert_eq!(metrics.operation_count("CreateVolume", "ok"), 1);
        assert_eq!(metrics.operation_count("CreateVolume", "AlreadyExists"), 1);
        assert_eq!(metrics.replay_count("CreateVolume"), 1);
    }

    #[test]
    fn test_encode() {
        let metrics = ControllerMetrics::new().unwrap();
        {
            let _timer = metrics.start_timer("DeleteSnapshot");
        }
        metrics.record_supervisor_restart();

        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("csi_controller_operation_duration_seconds"));
        assert!(text.contains("csi_controller_supervisor_restarts_total 1"));
    }
}

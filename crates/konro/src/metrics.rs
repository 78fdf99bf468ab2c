//! Per-instance execution metrics.
//!
//! A [`MetricReporter`] is constructed during instance initialization when
//! the model configuration enables metrics, and receives counts and
//! latencies around every execution. Aggregation and export are the host
//! process's concern; the reporter only accumulates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Accumulates execution counts and latency for one model instance.
#[derive(Debug)]
pub struct MetricReporter {
    model_name: String,
    instance_name: String,
    device_id: i32,

    /// Number of batches handed to the backend
    execution_count: AtomicU64,
    /// Number of requests across all executed batches
    inference_count: AtomicU64,
    /// Cumulative wall time spent in backend execution calls, in microseconds
    execution_duration_us: AtomicU64,
}

impl MetricReporter {
    pub(crate) fn new(model_name: &str, instance_name: &str, device_id: i32) -> Self {
        Self {
            model_name: model_name.to_string(),
            instance_name: instance_name.to_string(),
            device_id,
            execution_count: AtomicU64::new(0),
            inference_count: AtomicU64::new(0),
            execution_duration_us: AtomicU64::new(0),
        }
    }

    pub(crate) fn observe_execution(&self, batch_size: usize, duration: Duration) {
        self.execution_count.fetch_add(1, Ordering::Relaxed);
        self.inference_count
            .fetch_add(batch_size as u64, Ordering::Relaxed);
        self.execution_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Number of batches executed so far.
    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Relaxed)
    }

    /// Number of requests executed so far, across all batches.
    pub fn inference_count(&self) -> u64 {
        self.inference_count.load(Ordering::Relaxed)
    }

    /// Cumulative time spent in backend execution calls.
    pub fn execution_duration(&self) -> Duration {
        Duration::from_micros(self.execution_duration_us.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_accumulates() {
        let reporter = MetricReporter::new("resnet", "resnet_0_0", 0);
        reporter.observe_execution(4, Duration::from_micros(250));
        reporter.observe_execution(2, Duration::from_micros(150));

        assert_eq!(reporter.execution_count(), 2);
        assert_eq!(reporter.inference_count(), 6);
        assert_eq!(reporter.execution_duration(), Duration::from_micros(400));
        assert_eq!(reporter.model_name(), "resnet");
        assert_eq!(reporter.device_id(), 0);
    }
}

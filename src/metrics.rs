//! Metrics sink injected into the training driver.
//!
//! The driver never talks to a concrete logging backend; it reports
//! scalars through this trait. Tests use [`NoopMetrics`]; the default
//! backend writes through the `log` facade.

use std::collections::HashMap;

/// Receives scalar training statistics keyed by name and environment step.
pub trait MetricsSink {
    /// Records one scalar at the given global environment-step count.
    fn scalar(&mut self, name: &str, value: f64, step: u64);
}

/// Discards everything. Used in tests.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn scalar(&mut self, _name: &str, _value: f64, _step: u64) {}
}

/// Emits each scalar as a `log::info!` line.
#[derive(Debug, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn scalar(&mut self, name: &str, value: f64, step: u64) {
        log::info!(target: "onpolicy::metrics", "step={step} {name}={value:.6}");
    }
}

/// Keeps the last value per key in memory. Useful for assertions.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    values: HashMap<String, (f64, u64)>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last recorded value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).map(|(v, _)| *v)
    }
}

impl MetricsSink for MemoryMetrics {
    fn scalar(&mut self, name: &str, value: f64, step: u64) {
        self.values.insert(name.to_string(), (value, step));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_last_value() {
        let mut sink = MemoryMetrics::new();
        sink.scalar("value_loss", 1.0, 0);
        sink.scalar("value_loss", 0.5, 100);
        assert_eq!(sink.get("value_loss"), Some(0.5));
        assert_eq!(sink.get("missing"), None);
    }

    #[test]
    fn noop_sink_accepts_anything() {
        let mut sink = NoopMetrics;
        sink.scalar("anything", f64::NAN, 3);
    }
}

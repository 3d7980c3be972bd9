//! Timing and counting hooks for the incident engine.
//!
//! A `MetricsSink` is handed to the orchestrator and the resolution policy at
//! construction time, so concurrent calls never share timer state.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait MetricsSink: Send + Sync {
    /// Elapsed wall time of a named step (`find_active_incident`, `batch_resolve`, ...).
    fn record_timing(&self, step: &'static str, elapsed: Duration);

    /// Point-in-time value such as `batch_size` or `resolved_count`.
    fn record_value(&self, name: &'static str, value: f64);

    /// Monotonic event counter (`incident_opened`, `incident_closed`, ...).
    fn increment(&self, event: &'static str, by: u64);
}

/// Measures one step. Records when stopped, or on drop if the step bailed out early.
pub struct StepTimer {
    sink: Arc<dyn MetricsSink>,
    step: &'static str,
    started: Instant,
    recorded: bool,
}

impl StepTimer {
    pub fn start(sink: &Arc<dyn MetricsSink>, step: &'static str) -> Self {
        Self {
            sink: Arc::clone(sink),
            step,
            started: Instant::now(),
            recorded: false,
        }
    }

    pub fn stop(mut self) -> Duration {
        let elapsed = self.started.elapsed();
        self.sink.record_timing(self.step, elapsed);
        self.recorded = true;
        elapsed
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        if !self.recorded {
            self.sink.record_timing(self.step, self.started.elapsed());
        }
    }
}

/// Forwards to the global `metrics` recorder (Prometheus in the binary).
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn record_timing(&self, step: &'static str, elapsed: Duration) {
        ::metrics::histogram!("site_incidents_step_seconds", "step" => step)
            .record(elapsed.as_secs_f64());
    }

    fn record_value(&self, name: &'static str, value: f64) {
        ::metrics::gauge!("site_incidents_value", "name" => name).set(value);
    }

    fn increment(&self, event: &'static str, by: u64) {
        ::metrics::counter!("site_incidents_events_total", "event" => event).increment(by);
    }
}

/// Keeps every observation in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    timings: Mutex<Vec<(&'static str, Duration)>>,
    values: Mutex<Vec<(&'static str, f64)>>,
    counters: Mutex<Vec<(&'static str, u64)>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn timed_steps(&self) -> Vec<&'static str> {
        self.timings
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(step, _)| *step)
            .collect()
    }

    /// Most recent value recorded under `name`.
    pub fn last_value(&self, name: &str) -> Option<f64> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    pub fn count(&self, event: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, by)| *by)
            .sum()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_timing(&self, step: &'static str, elapsed: Duration) {
        self.timings
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((step, elapsed));
    }

    fn record_value(&self, name: &'static str, value: f64) {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((name, value));
    }

    fn increment(&self, event: &'static str, by: u64) {
        self.counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((event, by));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_records_once_when_stopped() {
        let recording = RecordingMetrics::new();
        let sink: Arc<dyn MetricsSink> = recording.clone();

        let timer = StepTimer::start(&sink, "create_incident");
        timer.stop();

        assert_eq!(recording.timed_steps(), vec!["create_incident"]);
    }

    #[test]
    fn test_timer_records_on_early_drop() {
        let recording = RecordingMetrics::new();
        let sink: Arc<dyn MetricsSink> = recording.clone();

        {
            let _timer = StepTimer::start(&sink, "associate_alert");
        }

        assert_eq!(recording.timed_steps(), vec!["associate_alert"]);
    }

    #[test]
    fn test_values_and_counters() {
        let recording = RecordingMetrics::new();
        recording.record_value("batch_size", 5.0);
        recording.record_value("batch_size", 3.0);
        recording.increment("incident_opened", 1);
        recording.increment("incident_opened", 2);

        assert_eq!(recording.last_value("batch_size"), Some(3.0));
        assert_eq!(recording.last_value("error_count"), None);
        assert_eq!(recording.count("incident_opened"), 3);
    }
}

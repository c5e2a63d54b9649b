//! Observability backend (§6 "metrics pull"): a `MetricsSink` wired to the
//! process-wide Prometheus recorder, and a background pump that samples
//! per-agent queue/resilience state into gauges the inline counters can't
//! express (queue depth, DLQ depth, quarantine, breaker state).
//!
//! Grounded on `fc-router::lib.rs`'s declared-but-unimplemented `metrics`,
//! `warning`, and `health` modules, and on `fc-dev::main.rs`'s placeholder
//! `metrics_handler` ("In a real implementation, you'd use
//! metrics-exporter-prometheus") — this crate is that real implementation.

mod pump;
mod sink;

pub use pump::MetricsPump;
pub use sink::PrometheusMetricsSink;

/// Label set attached to a metric observation. Kept as an owned vec of pairs
/// rather than a map — small, cheap to build per call site, order-independent
/// to consumers.
pub type Labels = Vec<(&'static str, String)>;

/// Sink for counters/gauges/histograms (§6 "Consumed interfaces"). The
/// Prometheus-backed implementation lives in `mc-metrics`; this trait is the
/// seam workers/dispatcher/resilience code call through so they don't depend
/// on a concrete exporter.
pub trait MetricsSink: Send + Sync {
    fn counter_inc(&self, name: &'static str, labels: Labels, value: u64);
    fn gauge_set(&self, name: &'static str, labels: Labels, value: f64);
    fn histogram_observe(&self, name: &'static str, labels: Labels, value: f64);
}

/// No-op sink for tests and for components constructed without an
/// observability backend wired in yet.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn counter_inc(&self, _name: &'static str, _labels: Labels, _value: u64) {}
    fn gauge_set(&self, _name: &'static str, _labels: Labels, _value: f64) {}
    fn histogram_observe(&self, _name: &'static str, _labels: Labels, _value: f64) {}
}

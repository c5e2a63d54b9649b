use mc_store::{Labels, MetricsSink};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

fn to_labels(labels: Labels) -> Vec<metrics::Label> {
    labels.into_iter().map(|(k, v)| metrics::Label::new(k, v)).collect()
}

/// `MetricsSink` backed by the process-wide Prometheus recorder (§6 "metrics
/// pull"). `install` registers the recorder exactly once per process; the
/// returned handle renders the exposition text for the `/metrics` route.
pub struct PrometheusMetricsSink {
    handle: PrometheusHandle,
}

impl PrometheusMetricsSink {
    pub fn install() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn counter_inc(&self, name: &'static str, labels: Labels, value: u64) {
        metrics::counter!(name, to_labels(labels)).increment(value);
    }

    fn gauge_set(&self, name: &'static str, labels: Labels, value: f64) {
        metrics::gauge!(name, to_labels(labels)).set(value);
    }

    fn histogram_observe(&self, name: &'static str, labels: Labels, value: f64) {
        metrics::histogram!(name, to_labels(labels)).record(value);
    }
}

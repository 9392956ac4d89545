#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// HTTP listen address for the Prometheus scrape endpoint.
    pub listen: String,
    /// Metric name prefix, e.g. "pv".
    pub namespace: &'static str,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { listen: "127.0.0.1:9090".into(), namespace: "pv" }
    }
}

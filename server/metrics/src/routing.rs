//! Routing-engine counters under `{ns}_routing_*`, implementing the
//! `RouterMetrics` hook from pv-media.

use metrics::{counter, histogram};

use pv_media::RouterMetrics;

pub struct RoutingMetrics {
    ns: &'static str,
}

impl RoutingMetrics {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    #[inline]
    fn drop_reason(&self, reason: &'static str) {
        counter!(format!("{}_routing_drops_total", self.ns), "reason" => reason).increment(1);
    }
}

impl RouterMetrics for RoutingMetrics {
    fn inc_rx_packets(&self) {
        counter!(format!("{}_routing_rx_packets_total", self.ns)).increment(1);
    }

    fn inc_rx_bytes(&self, n: usize) {
        counter!(format!("{}_routing_rx_bytes_total", self.ns)).increment(n as u64);
    }

    fn inc_drop_malformed(&self) {
        self.drop_reason("malformed");
    }

    fn inc_drop_unknown_sender(&self) {
        self.drop_reason("unknown_sender");
    }

    fn inc_drop_muted(&self) {
        self.drop_reason("muted");
    }

    fn inc_drop_not_in_world(&self) {
        self.drop_reason("not_in_world");
    }

    fn inc_drop_queue_full(&self) {
        self.drop_reason("queue_full");
    }

    fn inc_send_failed(&self) {
        counter!(format!("{}_routing_send_failures_total", self.ns)).increment(1);
    }

    fn inc_forwarded(&self, fanout: usize) {
        counter!(format!("{}_routing_forwarded_total", self.ns)).increment(1);
        histogram!(format!("{}_routing_fanout", self.ns)).record(fanout as f64);
    }
}

//! Session lifecycle counters under `{ns}_session_*`.

use metrics::{counter, gauge};

pub struct SessionMetrics {
    ns: &'static str,
}

impl SessionMetrics {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    pub fn conn_opened(&self) {
        counter!(format!("{}_session_connections_total", self.ns)).increment(1);
        gauge!(format!("{}_session_active", self.ns)).increment(1.0);
    }

    pub fn conn_closed(&self) {
        gauge!(format!("{}_session_active", self.ns)).decrement(1.0);
    }

    pub fn auth_result(&self, outcome: &'static str) {
        counter!(format!("{}_session_auth_total", self.ns), "outcome" => outcome).increment(1);
    }

    pub fn origin_rejected(&self) {
        counter!(format!("{}_session_origin_rejected_total", self.ns)).increment(1);
    }

    pub fn session_timeout(&self) {
        counter!(format!("{}_session_pending_timeouts_total", self.ns)).increment(1);
    }
}

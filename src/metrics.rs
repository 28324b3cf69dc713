use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Endpoint-wide counters. All relaxed: these feed logs and diagnostics,
/// never control flow.
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicI64,
    pub requests_served: AtomicU64,
    pub bytes_written: AtomicU64,
    pub parse_failures: AtomicU64,
    pub timeouts: AtomicU64,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_conn(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_connection_churn() {
        let m = EndpointMetrics::new();
        m.inc_conn();
        m.inc_conn();
        m.dec_conn();
        assert_eq!(m.connections_accepted.load(Ordering::Relaxed), 2);
        assert_eq!(m.active_connections.load(Ordering::Relaxed), 1);
    }
}

//! Gateway metrics — lightweight in-process counters
//!
//! Atomic counters surfaced through the orchestrator's health snapshot;
//! no external metrics backend.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

/// Point-in-time view of all counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    /// Responses by status class (2xx, 3xx, 4xx, 5xx)
    pub status_classes: HashMap<String, u64>,
    pub active_connections: i64,
    /// Per-route request counts
    pub route_requests: HashMap<String, u64>,
}

/// Metrics collector shared by every worker
pub struct GatewayMetrics {
    total_requests: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    active_connections: AtomicI64,
    route_requests: RwLock<HashMap<String, u64>>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_3xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            route_requests: RwLock::new(HashMap::new()),
        }
    }

    /// Record a completed request
    pub fn record_request(&self, status: u16, route_id: Option<&str>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match status / 100 {
            2 => self.status_2xx.fetch_add(1, Ordering::Relaxed),
            3 => self.status_3xx.fetch_add(1, Ordering::Relaxed),
            4 => self.status_4xx.fetch_add(1, Ordering::Relaxed),
            5 => self.status_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        if let Some(route_id) = route_id {
            let mut map = self.route_requests.write().unwrap();
            *map.entry(route_id.to_string()).or_insert(0) += 1;
        }
    }

    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut status_classes = HashMap::new();
        status_classes.insert("2xx".to_string(), self.status_2xx.load(Ordering::Relaxed));
        status_classes.insert("3xx".to_string(), self.status_3xx.load(Ordering::Relaxed));
        status_classes.insert("4xx".to_string(), self.status_4xx.load(Ordering::Relaxed));
        status_classes.insert("5xx".to_string(), self.status_5xx.load(Ordering::Relaxed));

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            status_classes,
            active_connections: self.active_connections.load(Ordering::Relaxed),
            route_requests: self.route_requests.read().unwrap().clone(),
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_classes() {
        let metrics = GatewayMetrics::new();
        metrics.record_request(200, Some("r1"));
        metrics.record_request(204, Some("r1"));
        metrics.record_request(404, None);
        metrics.record_request(503, Some("r2"));

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 4);
        assert_eq!(snap.status_classes["2xx"], 2);
        assert_eq!(snap.status_classes["4xx"], 1);
        assert_eq!(snap.status_classes["5xx"], 1);
        assert_eq!(snap.route_requests["r1"], 2);
        assert_eq!(snap.route_requests["r2"], 1);
    }

    #[test]
    fn test_connection_gauge() {
        let metrics = GatewayMetrics::new();
        metrics.inc_connections();
        metrics.inc_connections();
        metrics.dec_connections();
        assert_eq!(metrics.snapshot().active_connections, 1);
    }
}

//! Node health — active probing and passive reporting
//!
//! Health state is tracked per (upstream scope, node address). The
//! active prober flips nodes after N consecutive probe failures and
//! recovers them after M consecutive successes. Passive reports count
//! real-request statuses against the configured unhealthy set; each
//! request's status is counted at most once. Passive marks recover only
//! through active probing, so upstreams without active checks rely on
//! the selector's full-set fallback for availability.

use crate::store::{ActiveCheck, ConfigStore, PassiveCheck, ProbeKind, Upstream};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mutable health counters of one node
pub struct NodeHealth {
    healthy: AtomicBool,
    fail_streak: AtomicU32,
    success_streak: AtomicU32,
}

impl NodeHealth {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            fail_streak: AtomicU32::new(0),
            success_streak: AtomicU32::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Shared health table across workers
pub struct HealthRegistry {
    nodes: DashMap<(String, String), Arc<NodeHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    fn node(&self, scope: &str, addr: &str) -> Arc<NodeHealth> {
        self.nodes
            .entry((scope.to_string(), addr.to_string()))
            .or_insert_with(|| Arc::new(NodeHealth::new()))
            .clone()
    }

    pub fn is_healthy(&self, scope: &str, addr: &str) -> bool {
        self.nodes
            .get(&(scope.to_string(), addr.to_string()))
            .map(|h| h.is_healthy())
            .unwrap_or(true)
    }

    /// Record a real-request outcome against the passive thresholds.
    /// One request contributes one count, however the status set is
    /// shaped.
    pub fn report_passive(&self, scope: &str, addr: &str, status: u16, passive: &PassiveCheck) {
        let node = self.node(scope, addr);

        let is_unhealthy_status = passive.unhealthy_statuses.iter().any(|s| *s == status);
        if !is_unhealthy_status {
            node.fail_streak.store(0, Ordering::Relaxed);
            return;
        }

        let streak = node.fail_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= passive.unhealthy_threshold && node.healthy.swap(false, Ordering::Relaxed) {
            tracing::warn!(
                scope,
                node = addr,
                status,
                streak,
                "Node marked unhealthy by passive checks"
            );
        }
    }

    /// Record an active probe outcome
    pub fn report_active(&self, scope: &str, addr: &str, ok: bool, active: &ActiveCheck) {
        let node = self.node(scope, addr);
        if ok {
            node.fail_streak.store(0, Ordering::Relaxed);
            let streak = node.success_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if !node.is_healthy() && streak >= active.healthy_threshold {
                node.healthy.store(true, Ordering::Relaxed);
                tracing::info!(scope, node = addr, "Node recovered by active probe");
            }
        } else {
            node.success_streak.store(0, Ordering::Relaxed);
            let streak = node.fail_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if node.is_healthy() && streak >= active.unhealthy_threshold {
                node.healthy.store(false, Ordering::Relaxed);
                tracing::warn!(scope, node = addr, "Node marked unhealthy by active probe");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Background prober over every upstream that configures active checks.
///
/// One instance runs per gateway; probe results land in the shared
/// registry so every worker's selection sees them.
pub struct ActiveProber {
    store: Arc<ConfigStore>,
    registry: Arc<HealthRegistry>,
    client: reqwest::Client,
}

impl ActiveProber {
    pub fn new(store: Arc<ConfigStore>, registry: Arc<HealthRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            store,
            registry,
            client,
        }
    }

    /// Probe loop; call from a spawned task
    pub async fn run(self: Arc<Self>) {
        let mut last_probe: std::collections::HashMap<String, std::time::Instant> =
            std::collections::HashMap::new();

        loop {
            let upstreams = self.store.upstreams();
            for upstream in upstreams.iter() {
                let active = match upstream.checks.as_ref().and_then(|c| c.active.as_ref()) {
                    Some(active) => active.clone(),
                    None => continue,
                };

                let due = last_probe
                    .get(&upstream.id)
                    .map(|at| at.elapsed() >= Duration::from_secs(active.interval_secs.max(1)))
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                last_probe.insert(upstream.id.clone(), std::time::Instant::now());

                self.probe_round(upstream, &active).await;
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Probe every node of one upstream once
    pub async fn probe_round(&self, upstream: &Arc<Upstream>, active: &ActiveCheck) {
        let scope = upstream_scope(&upstream.id);
        for node in &upstream.nodes {
            let ok = self.probe_node(&node.host, node.port, active).await;
            self.registry.report_active(&scope, &node.address(), ok, active);
        }
    }

    async fn probe_node(&self, host: &str, port: u16, active: &ActiveCheck) -> bool {
        let timeout = Duration::from_secs(active.timeout_secs.max(1));
        match active.kind {
            ProbeKind::Tcp => {
                tokio::time::timeout(
                    timeout,
                    tokio::net::TcpStream::connect((host, port)),
                )
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
            }
            ProbeKind::Http | ProbeKind::Https => {
                let scheme = if active.kind == ProbeKind::Https {
                    "https"
                } else {
                    "http"
                };
                let url = format!("{}://{}:{}{}", scheme, host, port, active.http_path);
                match self.client.get(&url).timeout(timeout).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(_) => false,
                }
            }
        }
    }
}

/// Health scope key of an upstream entity (inline upstreams use the
/// owning entity's key instead)
pub fn upstream_scope(id: &str) -> String {
    format!("upstream:{}", id)
}

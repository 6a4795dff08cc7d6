//! Upstream selection — effective upstream resolution, DNS
//! materialization, balancing, health, and retry budgets
//!
//! Resolution precedence for a route: its `upstream_id` reference, then
//! the upstream its service provides (the service's own `upstream_id`
//! before its inline upstream), then the route's inline upstream. The
//! committed selection carries a composed `conf_version` string that
//! changes whenever anything the selection was derived from changed, so
//! every downstream cache can key on it.

pub mod balancer;
pub mod dns;
pub mod health;

pub use balancer::Balancer;
pub use dns::{DnsCache, Materialized, Resolver, SystemResolver};
pub use health::{ActiveProber, HealthRegistry};

pub use crate::store::UpstreamNode;

use crate::ctx::RequestContext;
use crate::error::{GatewayError, Result};
use crate::router::{header_var_name, RequestVars};
use crate::store::{ConfigStore, HashOn, Route, Service, Upstream};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Cap applied to the implicit retry budget of large node sets
const DEFAULT_RETRY_CAP: u32 = 5;

/// Which entity the committed upstream configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfSource {
    Route,
    Service,
    Upstream,
}

impl std::fmt::Display for ConfSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConfSource::Route => "route",
            ConfSource::Service => "service",
            ConfSource::Upstream => "upstream",
        };
        f.write_str(name)
    }
}

/// The committed upstream selection of one request
#[derive(Debug, Clone)]
pub struct UpstreamConf {
    pub source: ConfSource,
    pub id: String,
    /// Composed version string: the source revision, `&<service rev>`
    /// when merged through a service, `#<ts>` when DNS replaced nodes
    pub version: String,
    pub upstream: Arc<Upstream>,
}

impl UpstreamConf {
    /// Health-state scope shared by every request hitting this entity
    pub fn health_scope(&self) -> String {
        format!("{}:{}", self.source, self.id)
    }

    /// Identity without the version, used to roll balancer state
    fn identity(&self) -> String {
        format!("{}:{}", self.source, self.id)
    }
}

/// Materializes and picks upstream nodes for requests
pub struct UpstreamSelector {
    store: Arc<ConfigStore>,
    dns: DnsCache,
    /// Balancer state per upstream identity, keyed off the version so a
    /// version change rolls the state
    balancers: DashMap<String, (String, Arc<Balancer>)>,
    pub health: Arc<HealthRegistry>,
}

impl UpstreamSelector {
    pub fn new(store: Arc<ConfigStore>, resolver: Arc<dyn Resolver>, dns_ttl: Duration) -> Self {
        Self {
            store,
            dns: DnsCache::new(resolver, dns_ttl),
            balancers: DashMap::new(),
            health: Arc::new(HealthRegistry::new()),
        }
    }

    /// Resolve the effective upstream of a matched route and materialize
    /// its node set.
    pub async fn resolve(
        &self,
        route: &Arc<Route>,
        service: Option<&Arc<Service>>,
    ) -> Result<UpstreamConf> {
        let (source, id, base_version, upstream) = if let Some(uid) = &route.upstream_id {
            let upstream = self.store.upstream(uid).ok_or_else(|| {
                GatewayError::UpstreamUnresolvable(format!(
                    "route '{}' references missing upstream '{}'",
                    route.id, uid
                ))
            })?;
            let version = upstream.version;
            (
                ConfSource::Upstream,
                uid.clone(),
                version.to_string(),
                upstream,
            )
        } else if let Some(service) = service.filter(|s| s.upstream_id.is_some() || s.upstream.is_some())
        {
            if let Some(uid) = &service.upstream_id {
                let upstream = self.store.upstream(uid).ok_or_else(|| {
                    GatewayError::UpstreamUnresolvable(format!(
                        "service '{}' references missing upstream '{}'",
                        service.id, uid
                    ))
                })?;
                let version = upstream.version;
                (
                    ConfSource::Upstream,
                    uid.clone(),
                    version.to_string(),
                    upstream,
                )
            } else {
                let inline = service.upstream.as_ref().unwrap();
                let mut upstream = inline.clone();
                upstream.version = service.version;
                (
                    ConfSource::Service,
                    service.id.clone(),
                    format!("{}&{}", route.version, service.version),
                    Arc::new(upstream),
                )
            }
        } else if let Some(inline) = &route.upstream {
            let mut upstream = inline.clone();
            upstream.version = route.version;
            (
                ConfSource::Route,
                route.id.clone(),
                route.version.to_string(),
                Arc::new(upstream),
            )
        } else {
            return Err(GatewayError::UpstreamUnresolvable(format!(
                "route '{}' resolves no upstream",
                route.id
            )));
        };

        upstream.validate()?;

        let conf = UpstreamConf {
            source,
            id,
            version: base_version,
            upstream,
        };

        self.materialize(conf).await
    }

    /// Resolve the effective upstream of a stream (L4) route
    pub async fn resolve_stream(
        &self,
        route: &Arc<crate::store::StreamRoute>,
    ) -> Result<UpstreamConf> {
        let conf = if let Some(uid) = &route.upstream_id {
            let upstream = self.store.upstream(uid).ok_or_else(|| {
                GatewayError::UpstreamUnresolvable(format!(
                    "stream route '{}' references missing upstream '{}'",
                    route.id, uid
                ))
            })?;
            UpstreamConf {
                source: ConfSource::Upstream,
                id: uid.clone(),
                version: upstream.version.to_string(),
                upstream,
            }
        } else if let Some(inline) = &route.upstream {
            let mut upstream = inline.clone();
            upstream.version = route.version;
            UpstreamConf {
                source: ConfSource::Route,
                id: route.id.clone(),
                version: route.version.to_string(),
                upstream: Arc::new(upstream),
            }
        } else {
            return Err(GatewayError::UpstreamUnresolvable(format!(
                "stream route '{}' resolves no upstream",
                route.id
            )));
        };

        conf.upstream.validate()?;
        self.materialize(conf).await
    }

    /// Apply DNS materialization and version tagging
    async fn materialize(&self, conf: UpstreamConf) -> Result<UpstreamConf> {
        if !conf.upstream.has_domain() {
            return Ok(conf);
        }

        let materialized = self
            .dns
            .materialize(&conf.identity(), conf.upstream.version, &conf.upstream)
            .await?;

        let version = match materialized.tag {
            Some(ts) => format!("{}#{}", conf.version, ts),
            None => conf.version,
        };

        Ok(UpstreamConf {
            version,
            upstream: materialized.upstream,
            ..conf
        })
    }

    /// Pick a node for the current attempt.
    ///
    /// Unhealthy and already-tried nodes are excluded first; if that
    /// leaves nothing the unhealthy set is readmitted, and only when
    /// every node was already tried may a node repeat.
    pub fn pick(&self, ctx: &mut RequestContext) -> Result<UpstreamNode> {
        let conf = ctx
            .upstream
            .clone()
            .ok_or_else(|| GatewayError::Other("no upstream committed to request".into()))?;

        let balancer = self.balancer_for(&conf);
        let hash_key = hash_key_of(&conf.upstream, &ctx.vars);
        let scope = conf.health_scope();

        let mut exclude: HashSet<String> = ctx.tried_nodes.clone();
        for node in &conf.upstream.nodes {
            if !self.health.is_healthy(&scope, &node.address()) {
                exclude.insert(node.address());
            }
        }

        let picked = balancer
            .pick(hash_key.as_deref(), &exclude)
            .or_else(|| balancer.pick(hash_key.as_deref(), &ctx.tried_nodes))
            .or_else(|| balancer.pick(hash_key.as_deref(), &HashSet::new()))
            .ok_or_else(|| {
                GatewayError::UpstreamUnresolvable(format!(
                    "upstream '{}' has no nodes",
                    conf.id
                ))
            })?;

        ctx.tried_nodes.insert(picked.address());
        ctx.picked_node = Some(picked.clone());
        tracing::debug!(
            upstream = conf.id,
            node = picked.address(),
            conf_version = conf.version,
            "Node picked"
        );
        Ok(picked)
    }

    /// Report a real-request outcome for passive health
    pub fn report(&self, ctx: &RequestContext, status: u16) {
        let (Some(conf), Some(node)) = (&ctx.upstream, &ctx.picked_node) else {
            return;
        };
        let Some(passive) = conf
            .upstream
            .checks
            .as_ref()
            .and_then(|c| c.passive.as_ref())
        else {
            return;
        };
        self.health
            .report_passive(&conf.health_scope(), &node.address(), status, passive);
    }

    /// Retry budget of the committed upstream
    pub fn retries(conf: &UpstreamConf) -> u32 {
        match conf.upstream.retries {
            Some(explicit) => explicit,
            None => (conf.upstream.nodes.len().saturating_sub(1) as u32).min(DEFAULT_RETRY_CAP),
        }
    }

    fn balancer_for(&self, conf: &UpstreamConf) -> Arc<Balancer> {
        let identity = conf.identity();
        if let Some(entry) = self.balancers.get(&identity) {
            if entry.0 == conf.version {
                return entry.1.clone();
            }
        }
        let balancer = Arc::new(Balancer::new(&conf.upstream));
        self.balancers
            .insert(identity, (conf.version.clone(), balancer.clone()));
        balancer
    }

    /// Drop DNS materializations and balancer state (full resync)
    pub fn invalidate_derivations(&self) {
        self.dns.clear();
        self.balancers.clear();
    }
}

/// Derive the consistent-hash key from the configured request attribute
fn hash_key_of(upstream: &Upstream, vars: &RequestVars) -> Option<String> {
    let key = upstream.key.as_deref()?;
    match upstream.hash_on.unwrap_or(HashOn::Vars) {
        HashOn::Vars => vars.get(key),
        HashOn::Header => vars.headers.get(&header_var_name(key)).cloned(),
        HashOn::Cookie => vars.cookies.get(key).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::ContextPool;
    use crate::store::watch::{Kind, WatchEvent};
    use serde_json::json;

    fn store() -> Arc<ConfigStore> {
        Arc::new(ConfigStore::new())
    }

    fn apply(store: &ConfigStore, kind: Kind, key: &str, value: serde_json::Value, revision: u64) {
        store.apply_event(WatchEvent {
            kind,
            key: key.to_string(),
            value: Some(value),
            revision,
        });
    }

    fn selector(store: Arc<ConfigStore>) -> UpstreamSelector {
        UpstreamSelector::new(store, Arc::new(SystemResolver), Duration::from_secs(30))
    }

    fn route_json(value: serde_json::Value, version: u64) -> Arc<Route> {
        let mut route: Route = serde_json::from_value(value).unwrap();
        route.version = version;
        Arc::new(route)
    }

    fn service_json(value: serde_json::Value, version: u64) -> Arc<Service> {
        let mut service: Service = serde_json::from_value(value).unwrap();
        service.version = version;
        Arc::new(service)
    }

    // --- Resolution precedence ---

    #[tokio::test]
    async fn test_resolve_inline_upstream() {
        let s = store();
        let sel = selector(s);
        let route = route_json(
            json!({"id":"r1","uri":"/","upstream":{"nodes":[{"host":"10.0.0.1","port":80}]}}),
            7,
        );

        let conf = sel.resolve(&route, None).await.unwrap();
        assert_eq!(conf.source, ConfSource::Route);
        assert_eq!(conf.id, "r1");
        assert_eq!(conf.version, "7");
        assert_eq!(conf.upstream.nodes[0].host, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_resolve_upstream_id_beats_inline_and_service() {
        let s = store();
        apply(
            &s,
            Kind::Upstreams,
            "u1",
            json!({"id":"u1","nodes":[{"host":"10.9.9.9","port":80}]}),
            42,
        );
        let sel = selector(s);

        let route = route_json(
            json!({
                "id":"r1","uri":"/","upstream_id":"u1","service_id":"s1",
                "upstream":{"nodes":[{"host":"10.0.0.1","port":80}]}
            }),
            7,
        );
        let service = service_json(
            json!({"id":"s1","upstream":{"nodes":[{"host":"10.1.1.1","port":80}]}}),
            9,
        );

        let conf = sel.resolve(&route, Some(&service)).await.unwrap();
        assert_eq!(conf.source, ConfSource::Upstream);
        assert_eq!(conf.id, "u1");
        assert_eq!(conf.version, "42");
        assert_eq!(conf.upstream.nodes[0].host, "10.9.9.9");
    }

    #[tokio::test]
    async fn test_resolve_service_upstream_beats_inline() {
        let s = store();
        let sel = selector(s);
        let route = route_json(
            json!({"id":"r1","uri":"/","service_id":"s1",
                   "upstream":{"nodes":[{"host":"10.0.0.1","port":80}]}}),
            7,
        );
        let service = service_json(
            json!({"id":"s1","upstream":{"nodes":[{"host":"10.1.1.1","port":80}]}}),
            9,
        );

        let conf = sel.resolve(&route, Some(&service)).await.unwrap();
        assert_eq!(conf.source, ConfSource::Service);
        assert_eq!(conf.id, "s1");
        assert_eq!(conf.version, "7&9");
        assert_eq!(conf.upstream.nodes[0].host, "10.1.1.1");
    }

    #[tokio::test]
    async fn test_resolve_service_upstream_id() {
        let s = store();
        apply(
            &s,
            Kind::Upstreams,
            "u2",
            json!({"id":"u2","nodes":[{"host":"10.2.2.2","port":80}]}),
            13,
        );
        let sel = selector(s);

        let route = route_json(json!({"id":"r1","uri":"/","service_id":"s1"}), 7);
        let service = service_json(json!({"id":"s1","upstream_id":"u2"}), 9);

        let conf = sel.resolve(&route, Some(&service)).await.unwrap();
        assert_eq!(conf.source, ConfSource::Upstream);
        assert_eq!(conf.version, "13");
    }

    #[tokio::test]
    async fn test_resolve_missing_upstream_id_errors() {
        let s = store();
        let sel = selector(s);
        let route = route_json(json!({"id":"r1","uri":"/","upstream_id":"ghost"}), 1);

        let result = sel.resolve(&route, None).await;
        assert!(matches!(result, Err(GatewayError::UpstreamUnresolvable(_))));
    }

    #[tokio::test]
    async fn test_resolve_no_upstream_errors() {
        let s = store();
        let sel = selector(s);
        let route = route_json(json!({"id":"r1","uri":"/"}), 1);

        let result = sel.resolve(&route, None).await;
        assert!(matches!(result, Err(GatewayError::UpstreamUnresolvable(_))));
    }

    // --- Picking ---

    fn committed_ctx(sel_conf: UpstreamConf) -> Box<RequestContext> {
        let pool = ContextPool::new(1);
        let mut ctx = pool.checkout();
        ctx.upstream = Some(sel_conf);
        ctx
    }

    fn two_node_conf() -> UpstreamConf {
        let upstream: Upstream = serde_json::from_value(json!({
            "id":"u1",
            "nodes":[{"host":"10.0.0.1","port":80},{"host":"10.0.0.2","port":80}],
            "checks":{"passive":{"unhealthy_statuses":[500],"unhealthy_threshold":1}}
        }))
        .unwrap();
        UpstreamConf {
            source: ConfSource::Upstream,
            id: "u1".into(),
            version: "1".into(),
            upstream: Arc::new(upstream),
        }
    }

    #[tokio::test]
    async fn test_pick_marks_tried() {
        let sel = selector(store());
        let mut ctx = committed_ctx(two_node_conf());

        let first = sel.pick(&mut ctx).unwrap();
        assert!(ctx.tried_nodes.contains(&first.address()));
        assert_eq!(ctx.picked_node.as_ref().unwrap().address(), first.address());

        // The retry pick avoids the tried node
        let second = sel.pick(&mut ctx).unwrap();
        assert_ne!(first.address(), second.address());
        assert_eq!(ctx.tried_nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_pick_repeats_only_when_exhausted() {
        let sel = selector(store());
        let mut ctx = committed_ctx(two_node_conf());

        sel.pick(&mut ctx).unwrap();
        sel.pick(&mut ctx).unwrap();
        // Both nodes tried; a further pick must still return something
        assert!(sel.pick(&mut ctx).is_ok());
    }

    #[tokio::test]
    async fn test_pick_excludes_unhealthy() {
        let sel = selector(store());
        let conf = two_node_conf();
        let passive = conf
            .upstream
            .checks
            .as_ref()
            .unwrap()
            .passive
            .clone()
            .unwrap();
        sel.health
            .report_passive(&conf.health_scope(), "10.0.0.1:80", 500, &passive);

        for _ in 0..4 {
            let mut ctx = committed_ctx(conf.clone());
            assert_eq!(sel.pick(&mut ctx).unwrap().address(), "10.0.0.2:80");
        }
    }

    #[tokio::test]
    async fn test_pick_all_unhealthy_falls_back_to_full_set() {
        let sel = selector(store());
        let conf = two_node_conf();
        let passive = conf
            .upstream
            .checks
            .as_ref()
            .unwrap()
            .passive
            .clone()
            .unwrap();
        sel.health
            .report_passive(&conf.health_scope(), "10.0.0.1:80", 500, &passive);
        sel.health
            .report_passive(&conf.health_scope(), "10.0.0.2:80", 500, &passive);

        let mut ctx = committed_ctx(conf);
        assert!(sel.pick(&mut ctx).is_ok());
    }

    #[tokio::test]
    async fn test_passive_report_via_ctx() {
        let sel = selector(store());
        let conf = two_node_conf();
        let mut ctx = committed_ctx(conf.clone());
        let node = sel.pick(&mut ctx).unwrap();

        sel.report(&ctx, 500);
        assert!(!sel.health.is_healthy(&conf.health_scope(), &node.address()));
    }

    #[tokio::test]
    async fn test_balancer_state_persists_across_requests() {
        let sel = selector(store());
        let conf = two_node_conf();

        let mut ctx_a = committed_ctx(conf.clone());
        let mut ctx_b = committed_ctx(conf.clone());
        let first = sel.pick(&mut ctx_a).unwrap();
        let second = sel.pick(&mut ctx_b).unwrap();
        // Round robin alternates across independent requests
        assert_ne!(first.address(), second.address());
    }

    #[tokio::test]
    async fn test_balancer_state_rolls_on_version_change() {
        let sel = selector(store());
        let conf_v1 = two_node_conf();
        let mut ctx = committed_ctx(conf_v1.clone());
        sel.pick(&mut ctx).unwrap();

        let mut conf_v2 = two_node_conf();
        conf_v2.version = "2".into();
        let mut ctx = committed_ctx(conf_v2);
        // A fresh balancer starts its rotation over
        assert!(sel.pick(&mut ctx).is_ok());
        assert_eq!(sel.balancers.len(), 1);
    }

    // --- chash key derivation ---

    #[test]
    fn test_hash_key_sources() {
        let mut vars = RequestVars {
            remote_addr: Some("10.0.0.9".parse().unwrap()),
            ..Default::default()
        };
        vars.headers.insert("x_session".into(), "h-val".into());
        vars.cookies.insert("sid".into(), "c-val".into());

        let mk = |hash_on: &str, key: &str| -> Upstream {
            serde_json::from_value(json!({
                "type":"chash","hash_on":hash_on,"key":key,
                "nodes":[{"host":"10.0.0.1","port":80}]
            }))
            .unwrap()
        };

        assert_eq!(
            hash_key_of(&mk("vars", "remote_addr"), &vars).as_deref(),
            Some("10.0.0.9")
        );
        assert_eq!(
            hash_key_of(&mk("header", "X-Session"), &vars).as_deref(),
            Some("h-val")
        );
        assert_eq!(
            hash_key_of(&mk("cookie", "sid"), &vars).as_deref(),
            Some("c-val")
        );
    }

    // --- Retries ---

    #[test]
    fn test_retry_budget_default() {
        let conf = two_node_conf();
        assert_eq!(UpstreamSelector::retries(&conf), 1);
    }

    #[test]
    fn test_retry_budget_explicit_and_cap() {
        let mut conf = two_node_conf();
        let mut upstream = (*conf.upstream).clone();
        upstream.retries = Some(9);
        conf.upstream = Arc::new(upstream);
        assert_eq!(UpstreamSelector::retries(&conf), 9);

        // Implicit budget is capped for large node sets
        let mut upstream: Upstream = serde_json::from_value(json!({
            "id":"big","nodes":[{"host":"10.0.0.1","port":80}]
        }))
        .unwrap();
        upstream.nodes = (0..20)
            .map(|i| UpstreamNode {
                host: format!("10.0.0.{}", i),
                port: 80,
                weight: 1,
            })
            .collect();
        let conf = UpstreamConf {
            source: ConfSource::Upstream,
            id: "big".into(),
            version: "1".into(),
            upstream: Arc::new(upstream),
        };
        assert_eq!(UpstreamSelector::retries(&conf), 5);
    }
}

//! Dynamic configuration entities
//!
//! Every entity carries an opaque `id` and a monotonically increasing
//! `version` assigned by the config store from the source revision. The
//! version is the cache key for everything derived from the entity
//! (compiled matchers, DNS-materialized node sets, balancer state).

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Plugin name → plugin-specific JSON configuration.
///
/// A `BTreeMap` keeps iteration order deterministic so that merged chains
/// compile identically across rebuilds.
pub type PluginMap = BTreeMap<String, serde_json::Value>;

/// Comparison operator in a route variable predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    /// Regex match (`~~`)
    Regex,
    /// Value is one of the listed values
    In,
    /// The variable exists, whatever its value
    Has,
}

impl VarOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "==" => Some(VarOp::Eq),
            "!=" => Some(VarOp::Ne),
            ">" => Some(VarOp::Gt),
            "<" => Some(VarOp::Lt),
            ">=" => Some(VarOp::Ge),
            "<=" => Some(VarOp::Le),
            "~~" => Some(VarOp::Regex),
            "IN" | "in" => Some(VarOp::In),
            "HAS" | "has" => Some(VarOp::Has),
            _ => None,
        }
    }
}

/// A single variable predicate: `[variable, operator, value]`
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "(String, String, serde_json::Value)")]
pub struct VarPredicate {
    pub var: String,
    pub op: VarOp,
    pub value: serde_json::Value,
}

impl TryFrom<(String, String, serde_json::Value)> for VarPredicate {
    type Error = String;

    fn try_from(raw: (String, String, serde_json::Value)) -> std::result::Result<Self, String> {
        let (var, op_str, value) = raw;
        let op = VarOp::parse(&op_str).ok_or_else(|| format!("unknown operator '{}'", op_str))?;
        Ok(Self { var, op, value })
    }
}

/// A route: match predicate plus processing directive
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub id: String,
    /// Source revision, assigned by the store
    #[serde(skip)]
    pub version: u64,
    #[serde(default)]
    pub priority: i64,
    pub uri: Option<String>,
    pub uris: Option<Vec<String>>,
    pub host: Option<String>,
    pub hosts: Option<Vec<String>>,
    pub methods: Option<Vec<String>>,
    pub remote_addrs: Option<Vec<String>>,
    pub vars: Option<Vec<VarPredicate>>,
    pub upstream: Option<Upstream>,
    pub upstream_id: Option<String>,
    pub service_id: Option<String>,
    pub plugins: Option<PluginMap>,
    #[serde(default)]
    pub enable_websocket: bool,
}

impl Route {
    /// All URI patterns of this route (`uri` and `uris` combined)
    pub fn uri_patterns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(uri) = &self.uri {
            out.push(uri.as_str());
        }
        if let Some(uris) = &self.uris {
            out.extend(uris.iter().map(|u| u.as_str()));
        }
        out
    }

    /// All host patterns (`host` and `hosts` combined)
    pub fn host_patterns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(host) = &self.host {
            out.push(host.as_str());
        }
        if let Some(hosts) = &self.hosts {
            out.extend(hosts.iter().map(|h| h.as_str()));
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        if self.uri.is_none() && self.uris.as_ref().map(|u| u.is_empty()).unwrap_or(true) {
            return Err(GatewayError::Config(format!(
                "Route '{}' must define at least one of uri/uris",
                self.id
            )));
        }
        Ok(())
    }
}

/// A reusable bundle of upstream and plugin configuration shared by routes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub id: String,
    #[serde(skip)]
    pub version: u64,
    pub upstream: Option<Upstream>,
    pub upstream_id: Option<String>,
    pub plugins: Option<PluginMap>,
}

/// Load-balancing policy of an upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceKind {
    #[default]
    #[serde(rename = "roundrobin")]
    RoundRobin,
    Chash,
}

/// Which request attribute the consistent-hash key is derived from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashOn {
    #[default]
    Vars,
    Header,
    Cookie,
}

/// One backend node of an upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamNode {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl UpstreamNode {
    /// `host:port` form, used as the node identity in health and retry state
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the host is an IP literal (as opposed to a DNS name)
    pub fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }
}

/// Per-direction upstream timeouts, in seconds
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UpstreamTimeout {
    #[serde(default = "default_timeout")]
    pub connect: f64,
    #[serde(default = "default_timeout")]
    pub send: f64,
    #[serde(default = "default_timeout")]
    pub read: f64,
}

fn default_timeout() -> f64 {
    60.0
}

impl Default for UpstreamTimeout {
    fn default() -> Self {
        Self {
            connect: default_timeout(),
            send: default_timeout(),
            read: default_timeout(),
        }
    }
}

/// Active probe protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Http,
    Https,
    Tcp,
}

/// Background probing of upstream nodes
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveCheck {
    #[serde(default, rename = "type")]
    pub kind: ProbeKind,
    #[serde(default = "default_probe_path")]
    pub http_path: String,
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    /// Consecutive failures before a node is marked unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an unhealthy node recovers
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_probe_interval() -> u64 {
    1
}

fn default_probe_timeout() -> u64 {
    1
}

fn default_unhealthy_threshold() -> u32 {
    2
}

fn default_healthy_threshold() -> u32 {
    2
}

impl Default for ActiveCheck {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Http,
            http_path: default_probe_path(),
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

/// Health judgement from real request outcomes, reported in the log phase
#[derive(Debug, Clone, Deserialize)]
pub struct PassiveCheck {
    /// Response statuses that count toward the unhealthy threshold
    #[serde(default = "default_unhealthy_statuses")]
    pub unhealthy_statuses: Vec<u16>,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

fn default_unhealthy_statuses() -> Vec<u16> {
    vec![500, 502, 503, 504]
}

impl Default for PassiveCheck {
    fn default() -> Self {
        Self {
            unhealthy_statuses: default_unhealthy_statuses(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

/// Health check configuration of an upstream
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthChecks {
    pub active: Option<ActiveCheck>,
    pub passive: Option<PassiveCheck>,
}

/// A named pool of backend nodes plus a balancing policy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Upstream {
    #[serde(default)]
    pub id: String,
    #[serde(skip)]
    pub version: u64,
    #[serde(default, rename = "type")]
    pub kind: BalanceKind,
    pub hash_on: Option<HashOn>,
    pub key: Option<String>,
    #[serde(default)]
    pub nodes: Vec<UpstreamNode>,
    pub retries: Option<u32>,
    /// Response statuses that trigger a retry on another node
    pub retry_statuses: Option<Vec<u16>>,
    #[serde(default)]
    pub timeout: UpstreamTimeout,
    pub checks: Option<HealthChecks>,
    #[serde(default)]
    pub enable_websocket: bool,
}

impl Upstream {
    /// True iff any node host is a DNS name rather than an IP literal
    pub fn has_domain(&self) -> bool {
        self.nodes.iter().any(|n| !n.is_ip())
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(GatewayError::Config(format!(
                "Upstream '{}' has no nodes",
                self.id
            )));
        }
        if self.kind == BalanceKind::Chash && self.key.is_none() {
            return Err(GatewayError::Config(format!(
                "Upstream '{}' uses chash but defines no hash key",
                self.id
            )));
        }
        Ok(())
    }
}

/// An authenticated caller identity carrying plugin overlays
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Consumer {
    pub username: String,
    #[serde(skip)]
    pub version: u64,
    pub plugins: Option<PluginMap>,
}

/// Plugin configuration applied to every request, independent of routing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalRule {
    #[serde(default)]
    pub id: String,
    #[serde(skip)]
    pub version: u64,
    #[serde(default)]
    pub plugins: PluginMap,
}

/// A certificate/key pair selected by SNI during the TLS handshake
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ssl {
    #[serde(default)]
    pub id: String,
    #[serde(skip)]
    pub version: u64,
    pub sni: Option<String>,
    pub snis: Option<Vec<String>>,
    pub cert: String,
    pub key: String,
}

impl Ssl {
    pub fn sni_patterns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(sni) = &self.sni {
            out.push(sni.as_str());
        }
        if let Some(snis) = &self.snis {
            out.extend(snis.iter().map(|s| s.as_str()));
        }
        out
    }
}

/// An L4 route matched on listener port and client address
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamRoute {
    #[serde(default)]
    pub id: String,
    #[serde(skip)]
    pub version: u64,
    pub server_port: u16,
    pub remote_addr: Option<String>,
    pub upstream: Option<Upstream>,
    pub upstream_id: Option<String>,
    #[serde(default)]
    pub plugins: Option<PluginMap>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_from_json(json: &str) -> Route {
        serde_json::from_str(json).unwrap()
    }

    // --- Route ---

    #[test]
    fn test_route_minimal() {
        let r = route_from_json(r#"{"id":"1","uri":"/hello"}"#);
        assert_eq!(r.uri_patterns(), vec!["/hello"]);
        assert_eq!(r.priority, 0);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_route_uris_combined() {
        let r = route_from_json(r#"{"id":"1","uri":"/a","uris":["/b","/c"]}"#);
        assert_eq!(r.uri_patterns(), vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn test_route_without_uri_invalid() {
        let r = route_from_json(r#"{"id":"1","host":"foo.com"}"#);
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_route_hosts_combined() {
        let r = route_from_json(r#"{"id":"1","uri":"/","host":"a.com","hosts":["b.com"]}"#);
        assert_eq!(r.host_patterns(), vec!["a.com", "b.com"]);
    }

    #[test]
    fn test_route_vars_parse() {
        let r = route_from_json(
            r#"{"id":"1","uri":"/","vars":[["arg_name","==","jack"],["http_x_tier","IN",["gold","silver"]]]}"#,
        );
        let vars = r.vars.unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].var, "arg_name");
        assert_eq!(vars[0].op, VarOp::Eq);
        assert_eq!(vars[1].op, VarOp::In);
    }

    #[test]
    fn test_route_vars_unknown_op() {
        let result: std::result::Result<Route, _> =
            serde_json::from_str(r#"{"id":"1","uri":"/","vars":[["uri","%%","x"]]}"#);
        assert!(result.is_err());
    }

    // --- Upstream ---

    #[test]
    fn test_upstream_defaults() {
        let u: Upstream =
            serde_json::from_str(r#"{"nodes":[{"host":"127.0.0.1","port":1980}]}"#).unwrap();
        assert_eq!(u.kind, BalanceKind::RoundRobin);
        assert_eq!(u.nodes[0].weight, 1);
        assert!(!u.has_domain());
        assert!(u.validate().is_ok());
    }

    #[test]
    fn test_upstream_has_domain() {
        let u: Upstream = serde_json::from_str(
            r#"{"nodes":[{"host":"10.0.0.1","port":80},{"host":"svc.local","port":80}]}"#,
        )
        .unwrap();
        assert!(u.has_domain());
    }

    #[test]
    fn test_upstream_chash_requires_key() {
        let u: Upstream = serde_json::from_str(
            r#"{"type":"chash","nodes":[{"host":"10.0.0.1","port":80}]}"#,
        )
        .unwrap();
        assert!(u.validate().is_err());

        let u: Upstream = serde_json::from_str(
            r#"{"type":"chash","hash_on":"header","key":"X-Session","nodes":[{"host":"10.0.0.1","port":80}]}"#,
        )
        .unwrap();
        assert!(u.validate().is_ok());
        assert_eq!(u.hash_on, Some(HashOn::Header));
    }

    #[test]
    fn test_upstream_empty_nodes_invalid() {
        let u: Upstream = serde_json::from_str(r#"{"nodes":[]}"#).unwrap();
        assert!(u.validate().is_err());
    }

    #[test]
    fn test_node_address() {
        let n = UpstreamNode {
            host: "10.1.2.3".into(),
            port: 8080,
            weight: 2,
        };
        assert_eq!(n.address(), "10.1.2.3:8080");
        assert!(n.is_ip());

        let d = UpstreamNode {
            host: "svc.local".into(),
            port: 80,
            weight: 1,
        };
        assert!(!d.is_ip());
    }

    #[test]
    fn test_upstream_timeout_defaults() {
        let u: Upstream =
            serde_json::from_str(r#"{"nodes":[{"host":"127.0.0.1","port":80}]}"#).unwrap();
        assert_eq!(u.timeout.connect, 60.0);
        assert_eq!(u.timeout.read, 60.0);
    }

    // --- Health checks ---

    #[test]
    fn test_health_checks_parse() {
        let hc: HealthChecks = serde_json::from_str(
            r#"{"active":{"type":"tcp","interval_secs":5,"unhealthy_threshold":3},
                "passive":{"unhealthy_statuses":[500,503],"unhealthy_threshold":4}}"#,
        )
        .unwrap();
        let active = hc.active.unwrap();
        assert_eq!(active.kind, ProbeKind::Tcp);
        assert_eq!(active.interval_secs, 5);
        assert_eq!(active.unhealthy_threshold, 3);
        assert_eq!(active.healthy_threshold, 2);
        let passive = hc.passive.unwrap();
        assert_eq!(passive.unhealthy_statuses, vec![500, 503]);
        assert_eq!(passive.unhealthy_threshold, 4);
    }

    #[test]
    fn test_passive_check_defaults() {
        let p = PassiveCheck::default();
        assert_eq!(p.unhealthy_statuses, vec![500, 502, 503, 504]);
        assert_eq!(p.unhealthy_threshold, 2);
    }

    // --- Ssl ---

    #[test]
    fn test_ssl_sni_patterns() {
        let ssl: Ssl = serde_json::from_str(
            r#"{"id":"s1","sni":"a.com","snis":["*.b.com"],"cert":"PEM","key":"PEM"}"#,
        )
        .unwrap();
        assert_eq!(ssl.sni_patterns(), vec!["a.com", "*.b.com"]);
    }

    // --- Consumer / GlobalRule ---

    #[test]
    fn test_consumer_parse() {
        let c: Consumer = serde_json::from_str(
            r#"{"username":"jack","plugins":{"key-auth":{"key":"jack-key"}}}"#,
        )
        .unwrap();
        assert_eq!(c.username, "jack");
        assert!(c.plugins.unwrap().contains_key("key-auth"));
    }

    #[test]
    fn test_global_rule_parse() {
        let g: GlobalRule =
            serde_json::from_str(r#"{"id":"g1","plugins":{"limit-count":{"count":10}}}"#).unwrap();
        assert!(g.plugins.contains_key("limit-count"));
    }

    // --- StreamRoute ---

    #[test]
    fn test_stream_route_parse() {
        let s: StreamRoute = serde_json::from_str(
            r#"{"id":"sr1","server_port":9100,"remote_addr":"10.0.0.0/8",
                "upstream":{"nodes":[{"host":"127.0.0.1","port":1995}]}}"#,
        )
        .unwrap();
        assert_eq!(s.server_port, 9100);
        assert_eq!(s.remote_addr.as_deref(), Some("10.0.0.0/8"));
    }
}

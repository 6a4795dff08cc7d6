//! Per-request context
//!
//! One pooled struct threaded through every phase. It owns the request
//! attributes, the matched entities, the compiled plugin chains, the
//! upstream selection, and the in-flight response head during filter
//! phases. Checked out at request start and released in the log phase;
//! plugin-owned state lives in a namespaced extension map so plugins
//! cannot collide on well-known fields.

use crate::plugin::PluginChain;
use crate::router::RequestVars;
use crate::store::{ConfigStore, Consumer, Route, Service};
use crate::upstream::{UpstreamConf, UpstreamNode};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// All per-request state
pub struct RequestContext {
    /// Request attributes predicates and plugins resolve against
    pub vars: RequestVars,
    /// Path parameters captured by the matched URI pattern
    pub params: HashMap<String, String>,

    pub route: Option<Arc<Route>>,
    pub service: Option<Arc<Service>>,
    pub consumer: Option<Arc<Consumer>>,

    /// Handle to the live configuration snapshots, bound at checkout so
    /// plugins can resolve entities without module-level state
    pub store: Option<Arc<ConfigStore>>,

    /// Merged route-scope plugin chain
    pub plugins: PluginChain,
    /// Global-rule chain, executed before the route chain in each phase
    pub global_plugins: PluginChain,

    /// Committed upstream selection
    pub upstream: Option<UpstreamConf>,
    /// Node picked by the balancer for the current attempt
    pub picked_node: Option<UpstreamNode>,
    /// Node addresses already attempted in this request
    pub tried_nodes: HashSet<String>,

    /// Upstream path override set during rewrite
    pub upstream_uri: Option<String>,
    /// Upstream Host header override set during rewrite
    pub upstream_host: Option<String>,

    /// In-flight response head, populated before the filter phases
    pub resp_status: u16,
    pub resp_headers: http::HeaderMap,
    pub resp_body: Option<Bytes>,

    /// Plugin-owned state, namespaced by plugin name
    extensions: HashMap<String, serde_json::Value>,

    pub started_at: Instant,
}

impl RequestContext {
    fn new() -> Self {
        Self {
            vars: RequestVars::default(),
            params: HashMap::new(),
            route: None,
            service: None,
            consumer: None,
            store: None,
            plugins: Vec::new(),
            global_plugins: Vec::new(),
            upstream: None,
            picked_node: None,
            tried_nodes: HashSet::new(),
            upstream_uri: None,
            upstream_host: None,
            resp_status: 0,
            resp_headers: http::HeaderMap::new(),
            resp_body: None,
            extensions: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Store a plugin-owned value under `<plugin>.<key>`
    pub fn set_extension(&mut self, plugin: &str, key: &str, value: serde_json::Value) {
        self.extensions.insert(format!("{}.{}", plugin, key), value);
    }

    pub fn extension(&self, plugin: &str, key: &str) -> Option<&serde_json::Value> {
        self.extensions.get(&format!("{}.{}", plugin, key))
    }

    /// The `conf_version` of the committed upstream selection
    pub fn conf_version(&self) -> Option<&str> {
        self.upstream.as_ref().map(|u| u.version.as_str())
    }

    /// Clear everything for reuse from the pool
    fn reset(&mut self) {
        self.vars = RequestVars::default();
        self.params.clear();
        self.route = None;
        self.service = None;
        self.consumer = None;
        self.store = None;
        self.plugins.clear();
        self.global_plugins.clear();
        self.upstream = None;
        self.picked_node = None;
        self.tried_nodes.clear();
        self.upstream_uri = None;
        self.upstream_host = None;
        self.resp_status = 0;
        self.resp_headers.clear();
        self.resp_body = None;
        self.extensions.clear();
        self.started_at = Instant::now();
    }
}

/// Bounded free-list of request contexts.
///
/// Contexts above the capacity are simply dropped on release, so a
/// burst does not pin memory permanently.
pub struct ContextPool {
    free: Mutex<Vec<Box<RequestContext>>>,
    capacity: usize,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Take a fresh context, reusing a pooled one when available
    pub fn checkout(&self) -> Box<RequestContext> {
        let reused = self.free.lock().unwrap().pop();
        match reused {
            Some(mut ctx) => {
                ctx.started_at = Instant::now();
                ctx
            }
            None => Box::new(RequestContext::new()),
        }
    }

    /// Return a context after the log phase
    pub fn release(&self, mut ctx: Box<RequestContext>) {
        ctx.reset();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push(ctx);
        }
    }

    /// Number of idle contexts currently pooled
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(1024)
    }
}

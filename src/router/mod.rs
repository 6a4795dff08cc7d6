//! Router — compiles the routes collection into a URI-keyed matcher
//!
//! Matching walks a trie over the request path, then filters candidates
//! by host, method, client address, and variable predicates. Among the
//! surviving candidates the highest `priority` wins; ties fall to the
//! more specific URI (exact over prefix, longer over shorter), then to
//! the smaller route id so selection is stable.

pub mod cidr;
pub mod sni;
pub mod stream;
pub mod trie;
pub mod vars;

pub use cidr::CidrMatcher;
pub use sni::SniRouter;
pub use stream::StreamRouter;
pub use vars::{header_var_name, CompiledPredicate, RequestVars};

use crate::store::{Collection, Route};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use trie::{PathTrie, PatternKind};

#[derive(Debug, Clone)]
enum HostPattern {
    Exact(String),
    /// `*.example.com`, stored as the `.example.com` suffix
    Wildcard(String),
}

impl HostPattern {
    fn parse(pattern: &str) -> Self {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.strip_prefix("*.") {
            Some(suffix) => HostPattern::Wildcard(format!(".{}", suffix)),
            None => HostPattern::Exact(pattern),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(expected) => host == expected,
            HostPattern::Wildcard(suffix) => host
                .strip_suffix(suffix.as_str())
                .map(|label| !label.is_empty())
                .unwrap_or(false),
        }
    }
}

/// A route with its predicates compiled for matching
struct CompiledRoute {
    route: Arc<Route>,
    hosts: Vec<HostPattern>,
    methods: Option<HashSet<String>>,
    remote: Option<CidrMatcher>,
    predicates: Vec<CompiledPredicate>,
}

impl CompiledRoute {
    fn compile(route: Arc<Route>) -> crate::error::Result<Self> {
        let hosts = route
            .host_patterns()
            .iter()
            .map(|h| HostPattern::parse(h))
            .collect();

        let methods = route.methods.as_ref().filter(|m| !m.is_empty()).map(|m| {
            m.iter()
                .map(|method| method.to_ascii_uppercase())
                .collect::<HashSet<_>>()
        });

        let remote = match &route.remote_addrs {
            Some(addrs) if !addrs.is_empty() => Some(CidrMatcher::new(addrs)?),
            _ => None,
        };

        let mut predicates = Vec::new();
        if let Some(preds) = &route.vars {
            for pred in preds {
                predicates.push(CompiledPredicate::compile(pred)?);
            }
        }

        Ok(Self {
            route,
            hosts,
            methods,
            remote,
            predicates,
        })
    }

    fn accepts(&self, vars: &RequestVars) -> bool {
        if !self.hosts.is_empty() {
            let host = match &vars.host {
                Some(host) => host.to_ascii_lowercase(),
                None => return false,
            };
            if !self.hosts.iter().any(|p| p.matches(&host)) {
                return false;
            }
        }

        if let Some(methods) = &self.methods {
            if !methods.contains(&vars.method.to_ascii_uppercase()) {
                return false;
            }
        }

        if let Some(remote) = &self.remote {
            match vars.remote_addr {
                Some(ip) if remote.contains(ip) => {}
                _ => return false,
            }
        }

        self.predicates.iter().all(|p| p.holds(vars))
    }
}

/// A matched route plus the path parameters it captured
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: HashMap<String, String>,
}

/// Compiled, immutable matcher over one routes snapshot.
///
/// Rebuilt (and atomically swapped by the holder) whenever the routes
/// collection changes; matching itself is a pure function of the snapshot.
pub struct RouteMatcher {
    trie: PathTrie<Arc<CompiledRoute>>,
    revision: u64,
    route_count: usize,
}

impl RouteMatcher {
    /// Compile a routes snapshot. Routes that fail to compile are skipped
    /// and logged; one bad route must not take down the rest of the table.
    pub fn build(routes: &Collection<Route>) -> Self {
        let mut trie = PathTrie::new();
        let mut route_count = 0;

        for route in routes.iter() {
            let compiled = match CompiledRoute::compile(route.clone()) {
                Ok(compiled) => Arc::new(compiled),
                Err(e) => {
                    tracing::warn!(route = route.id, error = %e, "Skipping uncompilable route");
                    continue;
                }
            };
            for pattern in route.uri_patterns() {
                trie.insert(pattern, compiled.clone());
            }
            route_count += 1;
        }

        tracing::debug!(
            routes = route_count,
            revision = routes.revision(),
            "Route matcher compiled"
        );

        Self {
            trie,
            revision: routes.revision(),
            route_count,
        }
    }

    /// Match a request; `None` means 404
    pub fn find(&self, vars: &RequestVars) -> Option<RouteMatch> {
        let candidates = self.trie.matches(&vars.uri);

        let mut best: Option<(
            (i64, PatternKind, usize),
            &Arc<CompiledRoute>,
            HashMap<String, String>,
        )> = None;

        for candidate in candidates {
            let compiled = candidate.value;
            if !compiled.accepts(vars) {
                continue;
            }

            let rank = (
                compiled.route.priority,
                candidate.kind,
                candidate.pattern_len,
            );
            let replace = match &best {
                None => true,
                Some((current_rank, current, _)) => {
                    rank > *current_rank
                        || (rank == *current_rank && compiled.route.id < current.route.id)
                }
            };
            if replace {
                best = Some((rank, compiled, candidate.params));
            }
        }

        best.map(|(_, compiled, params)| RouteMatch {
            route: compiled.route.clone(),
            params,
        })
    }

    /// Revision of the snapshot this matcher was compiled from
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of routes in the table
    pub fn len(&self) -> usize {
        self.route_count
    }

    pub fn is_empty(&self) -> bool {
        self.route_count == 0
    }
}

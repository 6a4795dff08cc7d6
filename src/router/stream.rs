//! Stream (L4) sub-router — matches TCP routes on listener port and
//! client address.

use crate::router::cidr::CidrMatcher;
use crate::store::{Collection, StreamRoute};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

struct CompiledStreamRoute {
    route: Arc<StreamRoute>,
    remote: Option<CidrMatcher>,
}

/// Compiled matcher over the stream-route collection
pub struct StreamRouter {
    by_port: HashMap<u16, Vec<CompiledStreamRoute>>,
}

impl StreamRouter {
    pub fn build(routes: &Collection<StreamRoute>) -> Self {
        let mut by_port: HashMap<u16, Vec<CompiledStreamRoute>> = HashMap::new();

        for route in routes.iter() {
            let remote = match &route.remote_addr {
                Some(addr) => match CidrMatcher::new(std::slice::from_ref(addr)) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        tracing::warn!(
                            stream_route = route.id,
                            error = %e,
                            "Skipping stream route with invalid remote_addr"
                        );
                        continue;
                    }
                },
                None => None,
            };
            by_port
                .entry(route.server_port)
                .or_default()
                .push(CompiledStreamRoute {
                    route: route.clone(),
                    remote,
                });
        }

        // Routes with an address predicate are more specific; try them
        // first, then fall through to unrestricted routes, smaller id wins.
        for candidates in by_port.values_mut() {
            candidates.sort_by(|a, b| {
                b.remote
                    .is_some()
                    .cmp(&a.remote.is_some())
                    .then_with(|| a.route.id.cmp(&b.route.id))
            });
        }

        Self { by_port }
    }

    /// Match an accepted connection
    pub fn find(&self, server_port: u16, peer: IpAddr) -> Option<Arc<StreamRoute>> {
        let candidates = self.by_port.get(&server_port)?;
        for candidate in candidates {
            match &candidate.remote {
                Some(matcher) if !matcher.contains(peer) => continue,
                _ => return Some(candidate.route.clone()),
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.by_port.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }

    /// Every listener port referenced by a stream route
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.by_port.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

//! DNS materialization of upstream node sets
//!
//! Upstreams whose nodes carry hostnames are cloned with IP-resolved
//! nodes before selection. Clones are cached per upstream identity and
//! source version with a bounded TTL. When a re-resolution yields the
//! same node set the previous version tag is kept so downstream caches
//! keyed on `conf_version` stay warm; a changed answer stamps a fresh
//! timestamp tag.

use crate::error::{GatewayError, Result};
use crate::store::{Upstream, UpstreamNode};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Host → addresses lookup; injectable for tests
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system's stub resolver
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| GatewayError::DnsResolution {
                host: host.to_string(),
                cause: e.to_string(),
            })?
            .map(|sa| sa.ip())
            .collect();
        if addrs.is_empty() {
            return Err(GatewayError::DnsResolution {
                host: host.to_string(),
                cause: "no addresses returned".into(),
            });
        }
        Ok(addrs)
    }
}

struct CacheEntry {
    source_version: u64,
    nodes: Vec<UpstreamNode>,
    /// Timestamp suffix carried by the materialized version; `None`
    /// until an answer change is first observed
    tag: Option<u64>,
    expires_at: Instant,
}

/// The outcome of materializing one upstream
pub struct Materialized {
    pub upstream: Arc<Upstream>,
    /// `Some(ts)` when the conf version must carry a `#ts` suffix
    pub tag: Option<u64>,
}

/// TTL-bounded cache of IP-materialized upstream clones
pub struct DnsCache {
    resolver: Arc<dyn Resolver>,
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolver>, ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Materialize `upstream` under the cache identity `key`.
    ///
    /// `version` is the source revision of the entity the nodes came
    /// from; a version change invalidates the cached clone immediately,
    /// TTL expiry forces a re-resolution otherwise.
    pub async fn materialize(
        &self,
        key: &str,
        version: u64,
        upstream: &Arc<Upstream>,
    ) -> Result<Materialized> {
        if !upstream.has_domain() {
            return Ok(Materialized {
                upstream: upstream.clone(),
                tag: None,
            });
        }

        if let Some(entry) = self.entries.get(key) {
            if entry.source_version == version && Instant::now() < entry.expires_at {
                return Ok(Materialized {
                    upstream: Arc::new(with_nodes(upstream, entry.nodes.clone())),
                    tag: entry.tag,
                });
            }
        }

        let nodes = self.resolve_nodes(upstream).await?;

        // Keep the previous tag while the resolved node set is
        // equivalent; stamp a fresh one when the answers changed.
        let tag = match self.entries.get(key) {
            Some(previous) if previous.nodes == nodes => previous.tag,
            Some(_) => Some(unix_now()),
            None => None,
        };

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                source_version: version,
                nodes: nodes.clone(),
                tag,
                expires_at: Instant::now() + self.ttl,
            },
        );

        tracing::debug!(
            upstream = key,
            nodes = nodes.len(),
            tagged = tag.is_some(),
            "Upstream nodes materialized from DNS"
        );

        Ok(Materialized {
            upstream: Arc::new(with_nodes(upstream, nodes)),
            tag,
        })
    }

    async fn resolve_nodes(&self, upstream: &Upstream) -> Result<Vec<UpstreamNode>> {
        let mut nodes = Vec::with_capacity(upstream.nodes.len());
        for node in &upstream.nodes {
            if node.is_ip() {
                nodes.push(node.clone());
                continue;
            }
            let addrs = self.resolver.resolve(&node.host).await?;
            for addr in addrs {
                nodes.push(UpstreamNode {
                    host: addr.to_string(),
                    port: node.port,
                    weight: node.weight,
                });
            }
        }
        // Deterministic order makes node-set equivalence a plain compare
        nodes.sort_by(|a, b| {
            a.host
                .cmp(&b.host)
                .then_with(|| a.port.cmp(&b.port))
                .then_with(|| a.weight.cmp(&b.weight))
        });
        Ok(nodes)
    }

    /// Drop every cached materialization (config resync)
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn with_nodes(upstream: &Arc<Upstream>, nodes: Vec<UpstreamNode>) -> Upstream {
    let mut clone = (**upstream).clone();
    clone.nodes = nodes;
    clone
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

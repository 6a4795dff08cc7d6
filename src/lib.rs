//! # Portico
//!
//! A cloud-native API gateway: dynamic routing over a watch-driven
//! configuration store, a phase-ordered plugin pipeline, and
//! health-aware load balancing toward backend services.
//!
//! ## Architecture
//!
//! ```text
//! Listener → Router → Plugin Phases (rewrite/access) → Upstream Selector → Backend
//!                          ↑                                   ↑
//!                Config Snapshot Store  ←  watch  ←  YAML / KV source
//! ```
//!
//! ## Core features
//!
//! - **Dynamic routing**: trie-based URI matching with host, method,
//!   client-address, and variable predicates; priority and specificity
//!   tie-breaking
//! - **Plugins**: phase-ordered chains merged across consumer, route,
//!   service, and global scopes, with short-circuit responses
//! - **Load balancing**: smooth weighted round-robin and consistent
//!   hashing, active and passive health checks, bounded retries
//! - **Hot configuration**: routes, upstreams, services, consumers,
//!   certificates, and global rules apply without restart
//! - **TLS**: SNI-selected certificates straight from the config store
//! - **L4**: TCP stream routes with preread plugin support
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use portico::{config::GatewayConfig, Gateway};
//!
//! #[tokio::main]
//! async fn main() -> portico::Result<()> {
//!     let config = GatewayConfig::from_file("portico.toml").await?;
//!     let gateway = Gateway::new(config)?;
//!     gateway.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ctx;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod plugin;
pub mod proxy;
pub mod router;
pub mod store;
pub mod tls;
pub mod upstream;

pub use error::{GatewayError, Result};
pub use gateway::Gateway;

use serde::{Deserialize, Serialize};

/// Gateway runtime state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GatewayState {
    /// Gateway has been created but not yet started
    #[default]
    Created,
    /// Gateway is initializing listeners and the config watch
    Starting,
    /// Gateway is actively accepting and proxying requests
    Running,
    /// Gateway is reloading static configuration without downtime
    Reloading,
    /// Gateway is draining connections and shutting down
    Stopping,
    /// Gateway has fully stopped
    Stopped,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Reloading => write!(f, "reloading"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Gateway health status snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Current gateway state
    pub state: GatewayState,
    /// Uptime in seconds since gateway creation
    pub uptime_secs: u64,
    /// Whether the dynamic-config watch is connected; the last snapshot
    /// keeps serving while this is false
    pub config_store_healthy: bool,
    /// Number of in-flight requests
    pub active_connections: usize,
    /// Total requests handled since start
    pub total_requests: u64,
}

//! Centralized error types for the Portico gateway

use thiserror::Error;

/// Gateway error types
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration file parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// No route matched the request
    #[error("No route matched for request: {0}")]
    NoRouteMatch(String),

    /// The route's upstream reference could not be resolved
    #[error("Upstream unresolvable: {0}")]
    UpstreamUnresolvable(String),

    /// DNS resolution failed for an upstream node
    #[error("DNS resolution failed for {host}: {cause}")]
    DnsResolution { host: String, cause: String },

    /// All balancer attempts against the upstream failed
    #[error("Upstream exhausted after {attempts} attempts: {cause}")]
    BalancerExhausted { attempts: u32, cause: String },

    /// A plugin handler failed fatally
    #[error("Plugin '{plugin}' failed: {cause}")]
    Plugin { plugin: String, cause: String },

    /// Transient configuration-watch failure; last snapshot stays authoritative
    #[error("Configuration watch error: {0}")]
    ConfigTransient(String),

    /// No certificate matched the handshake SNI
    #[error("No certificate matched SNI: {0}")]
    TlsMatchFailure(String),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP request or response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;

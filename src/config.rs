//! Static gateway configuration
//!
//! Everything that cannot change without a process restart: listener
//! addresses, the dynamic-config source, DNS settings, and request
//! policies. Dynamic entities (routes, upstreams, …) come from the
//! snapshot store instead and never live here.

use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Where dynamic configuration comes from
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConfigSource {
    /// Local YAML document, reloaded on file change
    Yaml { path: String },
}

impl Default for ConfigSource {
    fn default() -> Self {
        ConfigSource::Yaml {
            path: "gateway.yaml".to_string(),
        }
    }
}

/// Top-level gateway configuration, loaded from TOML
///
/// # Example
///
/// ```toml
/// listen = "0.0.0.0:9080"
/// tls_listen = "0.0.0.0:9443"
/// stream_listen = [9100]
/// delete_uri_tail_slash = true
///
/// [config_source]
/// kind = "yaml"
/// path = "gateway.yaml"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listener address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Optional HTTPS listener address (certificates come from the
    /// dynamic ssl collection)
    pub tls_listen: Option<String>,

    /// L4 listener ports served by the stream proxy
    #[serde(default)]
    pub stream_listen: Vec<u16>,

    /// Source of the dynamic configuration
    #[serde(default)]
    pub config_source: ConfigSource,

    /// Nameserver list consulted for upstream hostnames; empty means the
    /// system resolver configuration
    #[serde(default)]
    pub dns_resolver: Vec<String>,

    /// Seconds a DNS-materialized node set stays valid
    #[serde(default = "default_dns_valid")]
    pub dns_resolver_valid: u64,

    /// Strip a trailing `/` from the URI before route matching
    #[serde(default)]
    pub delete_uri_tail_slash: bool,

    /// Gateway name surfaced in the `Server` response header
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Pid file written by `start`, consumed by `stop`/`reload`
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
}

fn default_listen() -> String {
    "0.0.0.0:9080".to_string()
}

fn default_dns_valid() -> u64 {
    30
}

fn default_server_name() -> String {
    "portico".to_string()
}

fn default_pid_file() -> String {
    "/tmp/portico.pid".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls_listen: None,
            stream_listen: Vec::new(),
            config_source: ConfigSource::default(),
            dns_resolver: Vec::new(),
            dns_resolver_valid: default_dns_valid(),
            delete_uri_tail_slash: false,
            server_name: default_server_name(),
            pid_file: default_pid_file(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse TOML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        self.listen.parse::<SocketAddr>().map_err(|_| {
            GatewayError::Config(format!("Invalid listen address '{}'", self.listen))
        })?;

        if let Some(tls) = &self.tls_listen {
            tls.parse::<SocketAddr>().map_err(|_| {
                GatewayError::Config(format!("Invalid tls_listen address '{}'", tls))
            })?;
        }

        let ConfigSource::Yaml { path } = &self.config_source;
        if path.is_empty() {
            return Err(GatewayError::Config(
                "config_source.path must not be empty".to_string(),
            ));
        }

        if self.server_name.is_empty() {
            return Err(GatewayError::Config(
                "server_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// `Server` header value: `<name>/<version>`
    pub fn server_header(&self) -> String {
        format!("{}/{}", self.server_name, env!("CARGO_PKG_VERSION"))
    }
}

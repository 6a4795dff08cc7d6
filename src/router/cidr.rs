//! Client-address matching — CIDR ranges and single IPs
//!
//! Used by route `remote_addrs` predicates and stream-route filters.
//! Supports IPv4/IPv6, CIDR notation, and single addresses.

use crate::error::{GatewayError, Result};
use ipnet::IpNet;
use std::net::IpAddr;

/// Matcher over a list of IP/CIDR entries
#[derive(Debug, Clone)]
pub struct CidrMatcher {
    networks: Vec<IpNet>,
    single_ips: Vec<IpAddr>,
}

impl CidrMatcher {
    /// Parse a list of IP/CIDR entries into a matcher
    pub fn new(entries: &[String]) -> Result<Self> {
        let mut networks = Vec::new();
        let mut single_ips = Vec::new();

        for entry in entries {
            let trimmed = entry.trim();
            if trimmed.contains('/') {
                let net: IpNet = trimmed.parse().map_err(|e| {
                    GatewayError::Config(format!("Invalid CIDR '{}': {}", trimmed, e))
                })?;
                networks.push(net);
            } else {
                let ip: IpAddr = trimmed.parse().map_err(|e| {
                    GatewayError::Config(format!("Invalid IP address '{}': {}", trimmed, e))
                })?;
                single_ips.push(ip);
            }
        }

        Ok(Self {
            networks,
            single_ips,
        })
    }

    /// Whether the address falls inside any entry
    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.single_ips.contains(&ip) {
            return true;
        }
        self.networks.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.single_ips.is_empty()
    }
}

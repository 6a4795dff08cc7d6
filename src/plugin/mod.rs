//! Plugin host — named plugins with phase handlers
//!
//! A plugin exposes any subset of the request phases. Handlers receive
//! the plugin's merged JSON configuration and the mutable request
//! context. Handlers in entry phases (`rewrite`, `access`, `preread`)
//! may short-circuit the request with an immediate response; filter
//! phases (`header_filter`, `body_filter`, `log`) always run for every
//! plugin in the chain.

pub mod builtin;
pub mod executor;
pub mod merge;
pub mod registry;

pub use executor::PhaseExecutor;
pub use registry::PluginRegistry;

use crate::ctx::RequestContext;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Plugin-specific JSON configuration
pub type PluginConf = serde_json::Value;

/// Request lifecycle phases a plugin can hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Rewrite,
    Access,
    Preread,
    Balancer,
    HeaderFilter,
    BodyFilter,
    Log,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Rewrite => "rewrite",
            Phase::Access => "access",
            Phase::Preread => "preread",
            Phase::Balancer => "balancer",
            Phase::HeaderFilter => "header_filter",
            Phase::BodyFilter => "body_filter",
            Phase::Log => "log",
        };
        f.write_str(name)
    }
}

/// Result of an entry-phase handler
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    /// Proceed to the next handler
    Continue,
    /// Emit this response now and skip the rest of the entry pipeline
    Respond { status: u16, body: Bytes },
}

impl PhaseOutcome {
    pub fn respond(status: u16, body: impl Into<Bytes>) -> Self {
        PhaseOutcome::Respond {
            status,
            body: body.into(),
        }
    }
}

/// A named plugin with a static ordering priority.
///
/// Every phase handler has a pass-through default, so implementations
/// override only the phases they participate in.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Chain position: higher priority runs earlier within a scope
    fn priority(&self) -> i32;

    /// Validate plugin configuration at chain-build time
    fn check_conf(&self, _conf: &PluginConf) -> Result<()> {
        Ok(())
    }

    async fn rewrite(&self, _conf: &PluginConf, _ctx: &mut RequestContext) -> Result<PhaseOutcome> {
        Ok(PhaseOutcome::Continue)
    }

    async fn access(&self, _conf: &PluginConf, _ctx: &mut RequestContext) -> Result<PhaseOutcome> {
        Ok(PhaseOutcome::Continue)
    }

    async fn preread(&self, _conf: &PluginConf, _ctx: &mut RequestContext) -> Result<PhaseOutcome> {
        Ok(PhaseOutcome::Continue)
    }

    /// Invoked once per upstream attempt with the currently picked node
    async fn balancer(&self, _conf: &PluginConf, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }

    async fn header_filter(&self, _conf: &PluginConf, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }

    async fn body_filter(&self, _conf: &PluginConf, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }

    async fn log(&self, _conf: &PluginConf, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }
}

/// One compiled chain position: plugin plus its merged configuration
#[derive(Clone)]
pub struct ChainEntry {
    pub plugin: Arc<dyn Plugin>,
    pub conf: Arc<PluginConf>,
}

/// An ordered, compiled plugin chain
pub type PluginChain = Vec<ChainEntry>;

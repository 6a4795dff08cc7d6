//! Plugin registry — named plugin instances and chain compilation

use crate::plugin::builtin;
use crate::plugin::{ChainEntry, Plugin, PluginChain};
use crate::store::PluginMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Loaded plugins, keyed by name
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in plugin set
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::key_auth::KeyAuth::default()));
        registry.register(Arc::new(builtin::limit_count::LimitCount::default()));
        registry.register(Arc::new(builtin::proxy_rewrite::ProxyRewrite::default()));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name();
        if self.plugins.insert(name, plugin).is_some() {
            tracing::warn!(plugin = name, "Plugin re-registered, previous instance replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.plugins.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Compile a merged plugin map into an ordered chain.
    ///
    /// Unknown names and configurations that fail validation are skipped
    /// with a warning; a misconfigured plugin must not take the route
    /// down. The chain is ordered by plugin priority descending, name
    /// ascending on ties so compilation is deterministic.
    pub fn build_chain(&self, conf: &PluginMap) -> PluginChain {
        let mut chain: PluginChain = Vec::with_capacity(conf.len());

        for (name, plugin_conf) in conf {
            let plugin = match self.plugins.get(name.as_str()) {
                Some(plugin) => plugin.clone(),
                None => {
                    tracing::warn!(plugin = name.as_str(), "Unknown plugin in config, skipped");
                    continue;
                }
            };
            if let Err(e) = plugin.check_conf(plugin_conf) {
                tracing::warn!(plugin = name.as_str(), error = %e, "Invalid plugin conf, skipped");
                continue;
            }
            chain.push(ChainEntry {
                plugin,
                conf: Arc::new(plugin_conf.clone()),
            });
        }

        chain.sort_by(|a, b| {
            b.plugin
                .priority()
                .cmp(&a.plugin.priority())
                .then_with(|| a.plugin.name().cmp(b.plugin.name()))
        });
        chain
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

//! proxy-rewrite — rewrites the upstream request line and Host header

use crate::ctx::RequestContext;
use crate::error::{GatewayError, Result};
use crate::plugin::{PhaseOutcome, Plugin, PluginConf};
use async_trait::async_trait;

#[derive(Default)]
pub struct ProxyRewrite;

#[async_trait]
impl Plugin for ProxyRewrite {
    fn name(&self) -> &'static str {
        "proxy-rewrite"
    }

    fn priority(&self) -> i32 {
        1008
    }

    fn check_conf(&self, conf: &PluginConf) -> Result<()> {
        if let Some(uri) = conf.get("uri") {
            let valid = uri.as_str().map(|u| u.starts_with('/')).unwrap_or(false);
            if !valid {
                return Err(GatewayError::Plugin {
                    plugin: self.name().to_string(),
                    cause: "'uri' must be a string starting with '/'".into(),
                });
            }
        }
        if let Some(host) = conf.get("host") {
            if !host.is_string() {
                return Err(GatewayError::Plugin {
                    plugin: self.name().to_string(),
                    cause: "'host' must be a string".into(),
                });
            }
        }
        Ok(())
    }

    async fn rewrite(&self, conf: &PluginConf, ctx: &mut RequestContext) -> Result<PhaseOutcome> {
        if let Some(uri) = conf.get("uri").and_then(|v| v.as_str()) {
            ctx.upstream_uri = Some(uri.to_string());
        }
        if let Some(host) = conf.get("host").and_then(|v| v.as_str()) {
            ctx.upstream_host = Some(host.to_string());
        }
        Ok(PhaseOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::ContextPool;
    use serde_json::json;

    #[tokio::test]
    async fn test_rewrites_uri_and_host() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.checkout();
        ctx.vars.uri = "/old".to_string();

        let conf = json!({"uri": "/new", "host": "internal.svc"});
        let out = ProxyRewrite.rewrite(&conf, &mut ctx).await.unwrap();
        assert!(matches!(out, PhaseOutcome::Continue));
        assert_eq!(ctx.upstream_uri.as_deref(), Some("/new"));
        assert_eq!(ctx.upstream_host.as_deref(), Some("internal.svc"));
    }

    #[tokio::test]
    async fn test_partial_conf_leaves_rest_untouched() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.checkout();

        ProxyRewrite
            .rewrite(&json!({"host": "a.svc"}), &mut ctx)
            .await
            .unwrap();
        assert!(ctx.upstream_uri.is_none());
        assert_eq!(ctx.upstream_host.as_deref(), Some("a.svc"));
    }

    #[test]
    fn test_check_conf() {
        assert!(ProxyRewrite.check_conf(&json!({"uri": "/ok"})).is_ok());
        assert!(ProxyRewrite.check_conf(&json!({})).is_ok());
        assert!(ProxyRewrite.check_conf(&json!({"uri": "no-slash"})).is_err());
        assert!(ProxyRewrite.check_conf(&json!({"uri": 5})).is_err());
        assert!(ProxyRewrite.check_conf(&json!({"host": 5})).is_err());
    }
}

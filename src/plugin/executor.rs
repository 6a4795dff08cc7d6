//! Phase executor — drives plugin chains through the request lifecycle
//!
//! Entry phases (`rewrite`, `access`, `preread`) stop at the first
//! handler that responds; the produced response still flows through the
//! filter phases. Filter phases (`header_filter`, `body_filter`, `log`)
//! run every handler and ignore outcomes. The `balancer` phase runs once
//! per upstream attempt. In every phase the global chain runs before the
//! route chain.

use crate::ctx::RequestContext;
use crate::plugin::{Phase, PhaseOutcome};
use bytes::Bytes;

const INTERNAL_ERROR_BODY: &str = r#"{"error_msg":"internal server error"}"#;

/// Stateless driver over the chains compiled into the request context
pub struct PhaseExecutor;

impl PhaseExecutor {
    /// Run an entry phase. Returns the short-circuit response, if any.
    ///
    /// A handler error is fatal for the request: it is logged and
    /// converted into a 500 short-circuit.
    pub async fn run_entry(phase: Phase, ctx: &mut RequestContext) -> Option<(u16, Bytes)> {
        debug_assert!(matches!(
            phase,
            Phase::Rewrite | Phase::Access | Phase::Preread
        ));

        let chains = [ctx.global_plugins.clone(), ctx.plugins.clone()];
        for chain in &chains {
            for entry in chain {
                let result = match phase {
                    Phase::Rewrite => entry.plugin.rewrite(&entry.conf, ctx).await,
                    Phase::Access => entry.plugin.access(&entry.conf, ctx).await,
                    Phase::Preread => entry.plugin.preread(&entry.conf, ctx).await,
                    _ => unreachable!("not an entry phase"),
                };
                match result {
                    Ok(PhaseOutcome::Continue) => {}
                    Ok(PhaseOutcome::Respond { status, body }) => {
                        tracing::debug!(
                            plugin = entry.plugin.name(),
                            phase = %phase,
                            status,
                            "Plugin short-circuited request"
                        );
                        return Some((status, body));
                    }
                    Err(e) => {
                        tracing::error!(
                            plugin = entry.plugin.name(),
                            phase = %phase,
                            error = %e,
                            "Plugin failed, aborting request"
                        );
                        return Some((500, Bytes::from_static(INTERNAL_ERROR_BODY.as_bytes())));
                    }
                }
            }
        }
        None
    }

    /// Run a filter phase over every handler; handler errors are logged
    /// and do not stop the chain.
    pub async fn run_filter(phase: Phase, ctx: &mut RequestContext) {
        debug_assert!(matches!(
            phase,
            Phase::HeaderFilter | Phase::BodyFilter | Phase::Log
        ));

        let chains = [ctx.global_plugins.clone(), ctx.plugins.clone()];
        for chain in &chains {
            for entry in chain {
                let result = match phase {
                    Phase::HeaderFilter => entry.plugin.header_filter(&entry.conf, ctx).await,
                    Phase::BodyFilter => entry.plugin.body_filter(&entry.conf, ctx).await,
                    Phase::Log => entry.plugin.log(&entry.conf, ctx).await,
                    _ => unreachable!("not a filter phase"),
                };
                if let Err(e) = result {
                    tracing::warn!(
                        plugin = entry.plugin.name(),
                        phase = %phase,
                        error = %e,
                        "Filter handler failed, continuing"
                    );
                }
            }
        }
    }

    /// Run the balancer phase for the current upstream attempt
    pub async fn run_balancer(ctx: &mut RequestContext) {
        let chains = [ctx.global_plugins.clone(), ctx.plugins.clone()];
        for chain in &chains {
            for entry in chain {
                if let Err(e) = entry.plugin.balancer(&entry.conf, ctx).await {
                    tracing::warn!(
                        plugin = entry.plugin.name(),
                        error = %e,
                        "Balancer handler failed, continuing"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::ContextPool;
    use crate::error::{GatewayError, Result};
    use crate::plugin::{ChainEntry, Plugin, PluginConf};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    /// Records its invocations into the context extension map
    struct Recorder {
        name: &'static str,
        priority: i32,
        respond_in_access: bool,
        fail_in_access: bool,
    }

    impl Recorder {
        fn passthrough(name: &'static str, priority: i32) -> Arc<dyn Plugin> {
            Arc::new(Self {
                name,
                priority,
                respond_in_access: false,
                fail_in_access: false,
            })
        }

        fn mark(&self, ctx: &mut RequestContext, phase: &str) {
            let key = format!("calls_{}", phase);
            let mut calls: Vec<String> = ctx
                .extension("test", &key)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            calls.push(self.name.to_string());
            ctx.set_extension("test", &key, json!(calls));
        }
    }

    fn calls(ctx: &RequestContext, phase: &str) -> Vec<String> {
        ctx.extension("test", &format!("calls_{}", phase))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }

        async fn rewrite(&self, _conf: &PluginConf, ctx: &mut RequestContext) -> Result<PhaseOutcome> {
            self.mark(ctx, "rewrite");
            Ok(PhaseOutcome::Continue)
        }

        async fn access(&self, _conf: &PluginConf, ctx: &mut RequestContext) -> Result<PhaseOutcome> {
            self.mark(ctx, "access");
            if self.fail_in_access {
                return Err(GatewayError::Plugin {
                    plugin: self.name.to_string(),
                    cause: "boom".into(),
                });
            }
            if self.respond_in_access {
                return Ok(PhaseOutcome::respond(403, "denied"));
            }
            Ok(PhaseOutcome::Continue)
        }

        async fn balancer(&self, _conf: &PluginConf, ctx: &mut RequestContext) -> Result<()> {
            self.mark(ctx, "balancer");
            Ok(())
        }

        async fn header_filter(&self, _conf: &PluginConf, ctx: &mut RequestContext) -> Result<()> {
            self.mark(ctx, "header_filter");
            Ok(())
        }

        async fn log(&self, _conf: &PluginConf, ctx: &mut RequestContext) -> Result<()> {
            self.mark(ctx, "log");
            Ok(())
        }
    }

    fn entry(plugin: Arc<dyn Plugin>) -> ChainEntry {
        ChainEntry {
            plugin,
            conf: Arc::new(json!({})),
        }
    }

    #[tokio::test]
    async fn test_entry_phase_runs_global_before_route() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.checkout();
        ctx.global_plugins = vec![entry(Recorder::passthrough("global", 1))];
        ctx.plugins = vec![
            entry(Recorder::passthrough("route-a", 100)),
            entry(Recorder::passthrough("route-b", 50)),
        ];

        let out = PhaseExecutor::run_entry(Phase::Access, &mut ctx).await;
        assert!(out.is_none());
        assert_eq!(calls(&ctx, "access"), vec!["global", "route-a", "route-b"]);
    }

    #[tokio::test]
    async fn test_entry_phase_short_circuit_stops_chain() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.checkout();
        ctx.plugins = vec![
            entry(Recorder::passthrough("first", 100)),
            entry(Arc::new(Recorder {
                name: "blocker",
                priority: 50,
                respond_in_access: true,
                fail_in_access: false,
            })),
            entry(Recorder::passthrough("after", 10)),
        ];

        let out = PhaseExecutor::run_entry(Phase::Access, &mut ctx).await;
        let (status, body) = out.unwrap();
        assert_eq!(status, 403);
        assert_eq!(body, Bytes::from("denied"));
        assert_eq!(calls(&ctx, "access"), vec!["first", "blocker"]);
    }

    #[tokio::test]
    async fn test_entry_phase_error_becomes_500() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.checkout();
        ctx.plugins = vec![
            entry(Arc::new(Recorder {
                name: "broken",
                priority: 100,
                respond_in_access: false,
                fail_in_access: true,
            })),
            entry(Recorder::passthrough("after", 10)),
        ];

        let (status, body) = PhaseExecutor::run_entry(Phase::Access, &mut ctx).await.unwrap();
        assert_eq!(status, 500);
        assert!(String::from_utf8_lossy(&body).contains("error_msg"));
        assert_eq!(calls(&ctx, "access"), vec!["broken"]);
    }

    #[tokio::test]
    async fn test_filter_phase_runs_all_handlers() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.checkout();
        ctx.global_plugins = vec![entry(Recorder::passthrough("global", 1))];
        ctx.plugins = vec![
            entry(Recorder::passthrough("a", 100)),
            entry(Recorder::passthrough("b", 50)),
        ];

        PhaseExecutor::run_filter(Phase::HeaderFilter, &mut ctx).await;
        assert_eq!(calls(&ctx, "header_filter"), vec!["global", "a", "b"]);

        PhaseExecutor::run_filter(Phase::Log, &mut ctx).await;
        assert_eq!(calls(&ctx, "log"), vec!["global", "a", "b"]);
    }

    #[tokio::test]
    async fn test_balancer_phase_runs_per_call() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.checkout();
        ctx.plugins = vec![entry(Recorder::passthrough("bal", 1))];

        PhaseExecutor::run_balancer(&mut ctx).await;
        PhaseExecutor::run_balancer(&mut ctx).await;
        assert_eq!(calls(&ctx, "balancer"), vec!["bal", "bal"]);
    }

    #[tokio::test]
    async fn test_rewrite_then_access_separate_records() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.checkout();
        ctx.plugins = vec![entry(Recorder::passthrough("p", 1))];

        assert!(PhaseExecutor::run_entry(Phase::Rewrite, &mut ctx).await.is_none());
        assert!(PhaseExecutor::run_entry(Phase::Access, &mut ctx).await.is_none());
        assert_eq!(calls(&ctx, "rewrite"), vec!["p"]);
        assert_eq!(calls(&ctx, "access"), vec!["p"]);
    }
}

//! limit-count — fixed-window request counting
//!
//! Counts requests per client key within a time window and rejects once
//! the budget is spent. Window state is shared across workers through
//! the plugin instance. Rate headers are emitted in `header_filter`, so
//! rejected requests carry them too.

use crate::ctx::RequestContext;
use crate::error::{GatewayError, Result};
use crate::plugin::{PhaseOutcome, Plugin, PluginConf};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

const DEFAULT_KEY: &str = "remote_addr";
const DEFAULT_REJECTED_CODE: u16 = 503;

struct Window {
    started_at: Instant,
    count: u64,
}

#[derive(Default)]
pub struct LimitCount {
    windows: DashMap<String, Window>,
}

struct Limits {
    count: u64,
    time_window: Duration,
    key: String,
    rejected_code: u16,
}

impl LimitCount {
    fn limits(conf: &PluginConf) -> Result<Limits> {
        let count = conf.get("count").and_then(|v| v.as_u64()).ok_or_else(|| {
            GatewayError::Plugin {
                plugin: "limit-count".to_string(),
                cause: "conf requires a positive 'count'".into(),
            }
        })?;
        if count == 0 {
            return Err(GatewayError::Plugin {
                plugin: "limit-count".to_string(),
                cause: "'count' must be at least 1".into(),
            });
        }
        let window_secs = conf
            .get("time_window")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| GatewayError::Plugin {
                plugin: "limit-count".to_string(),
                cause: "conf requires a positive 'time_window'".into(),
            })?;
        Ok(Limits {
            count,
            time_window: Duration::from_secs(window_secs.max(1)),
            key: conf
                .get("key")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_KEY)
                .to_string(),
            rejected_code: conf
                .get("rejected_code")
                .and_then(|v| v.as_u64())
                .map(|c| c as u16)
                .unwrap_or(DEFAULT_REJECTED_CODE),
        })
    }

    /// Count this request against its window; returns the remaining budget
    /// or `None` when the budget is already spent.
    fn consume(&self, counter_key: String, limits: &Limits) -> Option<u64> {
        let mut window = self.windows.entry(counter_key).or_insert_with(|| Window {
            started_at: Instant::now(),
            count: 0,
        });

        if window.started_at.elapsed() >= limits.time_window {
            window.started_at = Instant::now();
            window.count = 0;
        }

        if window.count >= limits.count {
            return None;
        }
        window.count += 1;
        Some(limits.count - window.count)
    }
}

#[async_trait]
impl Plugin for LimitCount {
    fn name(&self) -> &'static str {
        "limit-count"
    }

    fn priority(&self) -> i32 {
        1002
    }

    fn check_conf(&self, conf: &PluginConf) -> Result<()> {
        Self::limits(conf).map(|_| ())
    }

    async fn access(&self, conf: &PluginConf, ctx: &mut RequestContext) -> Result<PhaseOutcome> {
        let limits = Self::limits(conf)?;

        let key_value = ctx.vars.get(&limits.key).unwrap_or_default();
        let scope = ctx
            .route
            .as_ref()
            .map(|r| r.id.as_str())
            .unwrap_or("global");
        let counter_key = format!("{}:{}", scope, key_value);

        ctx.set_extension("limit-count", "limit", serde_json::json!(limits.count));
        match self.consume(counter_key, &limits) {
            Some(remaining) => {
                ctx.set_extension("limit-count", "remaining", serde_json::json!(remaining));
                Ok(PhaseOutcome::Continue)
            }
            None => {
                ctx.set_extension("limit-count", "remaining", serde_json::json!(0));
                Ok(PhaseOutcome::respond(
                    limits.rejected_code,
                    r#"{"error_msg":"API rate limit exceeded"}"#,
                ))
            }
        }
    }

    async fn header_filter(&self, _conf: &PluginConf, ctx: &mut RequestContext) -> Result<()> {
        let limit = ctx
            .extension("limit-count", "limit")
            .and_then(|v| v.as_u64());
        let remaining = ctx
            .extension("limit-count", "remaining")
            .and_then(|v| v.as_u64());

        if let (Some(limit), Some(remaining)) = (limit, remaining) {
            if let Ok(value) = http::HeaderValue::from_str(&limit.to_string()) {
                ctx.resp_headers.insert("x-ratelimit-limit", value);
            }
            if let Ok(value) = http::HeaderValue::from_str(&remaining.to_string()) {
                ctx.resp_headers.insert("x-ratelimit-remaining", value);
            }
        }
        Ok(())
    }
}

//! key-auth — consumer identification via API key header
//!
//! The route enables the plugin; each consumer carries its key under its
//! own `key-auth` plugin entry. A matching key binds the consumer to the
//! request during rewrite, which triggers the consumer plugin overlay
//! before the access phase.

use crate::ctx::RequestContext;
use crate::error::{GatewayError, Result};
use crate::plugin::{PhaseOutcome, Plugin, PluginConf};
use crate::router::header_var_name;
use async_trait::async_trait;

const DEFAULT_HEADER: &str = "apikey";

#[derive(Default)]
pub struct KeyAuth;

impl KeyAuth {
    fn header_name(conf: &PluginConf) -> String {
        conf.get("header")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_HEADER)
            .to_string()
    }
}

#[async_trait]
impl Plugin for KeyAuth {
    fn name(&self) -> &'static str {
        "key-auth"
    }

    fn priority(&self) -> i32 {
        2500
    }

    fn check_conf(&self, conf: &PluginConf) -> Result<()> {
        if !conf.is_object() {
            return Err(GatewayError::Plugin {
                plugin: self.name().to_string(),
                cause: "conf must be an object".into(),
            });
        }
        Ok(())
    }

    async fn rewrite(&self, conf: &PluginConf, ctx: &mut RequestContext) -> Result<PhaseOutcome> {
        // A consumer-overlaid conf carries the consumer's own key; the
        // consumer is already bound then, nothing left to check.
        if ctx.consumer.is_some() {
            return Ok(PhaseOutcome::Continue);
        }

        let header = Self::header_name(conf);
        let presented = match ctx.vars.headers.get(&header_var_name(&header)) {
            Some(key) if !key.is_empty() => key.clone(),
            _ => {
                return Ok(PhaseOutcome::respond(
                    401,
                    r#"{"message":"Missing API key in request"}"#,
                ));
            }
        };

        let store = match &ctx.store {
            Some(store) => store.clone(),
            None => {
                return Err(GatewayError::Plugin {
                    plugin: self.name().to_string(),
                    cause: "no config store bound to request".into(),
                });
            }
        };

        let matched = store.consumers().iter().cloned().find(|consumer| {
            consumer
                .plugins
                .as_ref()
                .and_then(|p| p.get("key-auth"))
                .and_then(|c| c.get("key"))
                .and_then(|k| k.as_str())
                .map(|k| k == presented)
                .unwrap_or(false)
        });

        match matched {
            Some(consumer) => {
                tracing::debug!(consumer = consumer.username, "Consumer identified");
                ctx.vars
                    .extra
                    .insert("consumer_name".to_string(), consumer.username.clone());
                ctx.consumer = Some(consumer);
                Ok(PhaseOutcome::Continue)
            }
            None => Ok(PhaseOutcome::respond(
                401,
                r#"{"message":"Invalid API key in request"}"#,
            )),
        }
    }
}

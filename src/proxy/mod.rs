//! Request pipeline — phase-ordered processing of every HTTP request
//!
//! Per request: route match → plugin merge → rewrite → consumer overlay
//! → access → upstream commit → balancer (per attempt) → forward →
//! header/body filters → log. Plugin short-circuits skip the remaining
//! entry work but still traverse the filter phases, so observability
//! plugins see every response the gateway emits.

pub mod forward;
pub mod stream;

pub use forward::{ForwardError, ForwardOutcome, HttpForwarder};

use crate::ctx::{ContextPool, RequestContext};
use crate::metrics::GatewayMetrics;
use crate::plugin::{merge, Phase, PhaseExecutor, PluginRegistry};
use crate::router::{header_var_name, RequestVars, RouteMatcher};
use crate::store::{ConfigStore, Kind};
use crate::upstream::UpstreamSelector;
use arc_swap::ArcSwap;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const NOT_FOUND_BODY: &str = r#"{"error_msg":"failed to match any routes"}"#;

/// Everything one worker needs to process requests
pub struct ProxyEngine {
    store: Arc<ConfigStore>,
    router: ArcSwap<RouteMatcher>,
    selector: Arc<UpstreamSelector>,
    registry: Arc<PluginRegistry>,
    pool: ContextPool,
    forwarder: HttpForwarder,
    metrics: Arc<GatewayMetrics>,
    server_header: String,
    delete_uri_tail_slash: bool,
}

impl ProxyEngine {
    pub fn new(
        store: Arc<ConfigStore>,
        selector: Arc<UpstreamSelector>,
        registry: Arc<PluginRegistry>,
        metrics: Arc<GatewayMetrics>,
        server_header: String,
        delete_uri_tail_slash: bool,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            router: ArcSwap::from_pointee(RouteMatcher::build(&store.routes())),
            store: store.clone(),
            selector,
            registry,
            pool: ContextPool::default(),
            forwarder: HttpForwarder::new(),
            metrics,
            server_header,
            delete_uri_tail_slash,
        });

        let weak = Arc::downgrade(&engine);
        store.on_change(Kind::Routes, move || {
            if let Some(engine) = weak.upgrade() {
                engine.rebuild_router();
            }
        });

        engine
    }

    /// Recompile the route matcher from the current snapshot
    pub fn rebuild_router(&self) {
        let matcher = RouteMatcher::build(&self.store.routes());
        tracing::info!(
            routes = matcher.len(),
            revision = matcher.revision(),
            "Route matcher rebuilt"
        );
        self.router.store(Arc::new(matcher));
    }

    pub fn router_revision(&self) -> u64 {
        self.router.load().revision()
    }

    /// Process one HTTP request end to end
    pub async fn handle(
        &self,
        req: hyper::Request<Incoming>,
        remote: SocketAddr,
    ) -> hyper::Response<Full<Bytes>> {
        self.metrics.inc_connections();
        let response = self.run_pipeline(req, remote).await;
        self.metrics.dec_connections();
        response
    }

    async fn run_pipeline(
        &self,
        req: hyper::Request<Incoming>,
        remote: SocketAddr,
    ) -> hyper::Response<Full<Bytes>> {
        let mut ctx = self.pool.checkout();
        ctx.store = Some(self.store.clone());

        let raw_query = req.uri().query().map(|q| q.to_string());
        build_vars(&mut ctx.vars, &req, remote, self.delete_uri_tail_slash);

        let global_map = merge::merge_global_rules(&self.store.global_rules());
        ctx.global_plugins = self.registry.build_chain(&global_map);

        // (status, body, body-is-ours) — our own bodies get a JSON content type
        let mut short: Option<(u16, Bytes, bool)> = None;

        // Route match; the global chain still observes unmatched requests
        if let Some(found) = self.router.load().find(&ctx.vars) {
            ctx.params = found.params;
            if let Some(sid) = &found.route.service_id {
                match self.store.service(sid) {
                    Some(service) => ctx.service = Some(service),
                    None => {
                        tracing::warn!(
                            route = found.route.id,
                            service = sid.as_str(),
                            "Route references missing service"
                        );
                        short = Some((
                            500,
                            Bytes::from_static(
                                br#"{"error_msg":"route references unknown service"}"#,
                            ),
                            true,
                        ));
                    }
                }
            }
            ctx.route = Some(found.route);
        }

        if short.is_none() {
            if let Some(route) = &ctx.route {
                let merged = merge::merge_route_service(
                    route.plugins.as_ref(),
                    ctx.service.as_ref().and_then(|s| s.plugins.as_ref()),
                );
                ctx.plugins = self.registry.build_chain(&merged);
            }
        }

        // Rewrite
        if short.is_none() {
            short = PhaseExecutor::run_entry(Phase::Rewrite, &mut ctx)
                .await
                .map(|(s, b)| (s, b, false));
        }

        // A consumer identified during rewrite overlays its plugin conf;
        // the new chain continues from access, its rewrite handlers are
        // intentionally skipped.
        if short.is_none() {
            if let (Some(route), Some(consumer)) = (ctx.route.clone(), ctx.consumer.clone()) {
                if let Some(consumer_plugins) = &consumer.plugins {
                    let base = merge::merge_route_service(
                        route.plugins.as_ref(),
                        ctx.service.as_ref().and_then(|s| s.plugins.as_ref()),
                    );
                    let overlaid = merge::overlay_consumer(&base, consumer_plugins);
                    ctx.plugins = self.registry.build_chain(&overlaid);
                }
            }
            short = PhaseExecutor::run_entry(Phase::Access, &mut ctx)
                .await
                .map(|(s, b)| (s, b, false));
        }

        if short.is_none() && ctx.route.is_none() {
            short = Some((404, Bytes::from_static(NOT_FOUND_BODY.as_bytes()), true));
        }

        // Upstream commit
        if short.is_none() {
            let route = ctx.route.clone().expect("route present past 404 check");
            match self.selector.resolve(&route, ctx.service.as_ref()).await {
                Ok(conf) => {
                    tracing::debug!(
                        route = route.id,
                        conf_type = %conf.source,
                        conf_id = conf.id,
                        conf_version = conf.version,
                        "Upstream committed"
                    );
                    ctx.upstream = Some(conf);
                }
                Err(e) => {
                    tracing::warn!(route = route.id, error = %e, "Upstream unresolvable");
                    short = Some((500, Bytes::from(format!(r#"{{"error_msg":"{}"}}"#, e)), true));
                }
            }
        }

        // Websocket upgrade takes over the connection
        if short.is_none() && wants_websocket(req.headers()) {
            let enabled = ctx.route.as_ref().map(|r| r.enable_websocket).unwrap_or(false)
                || ctx
                    .upstream
                    .as_ref()
                    .map(|c| c.upstream.enable_websocket)
                    .unwrap_or(false);
            if enabled {
                return self.tunnel_websocket(req, raw_query, ctx).await;
            }
        }

        let mut from_upstream = false;
        if short.is_none() {
            let method = req.method().clone();
            let headers = req.headers().clone();
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => Bytes::new(),
            };

            match self
                .forward_with_retries(&mut ctx, &method, &headers, raw_query.as_deref(), body)
                .await
            {
                Ok(outcome) => {
                    ctx.resp_status = outcome.status;
                    ctx.resp_headers = outcome.headers;
                    ctx.resp_body = Some(outcome.body);
                    from_upstream = true;
                }
                Err((status, body)) => short = Some((status, body, true)),
            }
        }

        if let Some((status, body, own_body)) = short {
            ctx.resp_status = status;
            ctx.resp_body = Some(body);
            if own_body {
                ctx.resp_headers.insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );
            }
        }

        if let Ok(server) = http::HeaderValue::from_str(&self.server_header) {
            ctx.resp_headers.insert(http::header::SERVER, server);
        }

        PhaseExecutor::run_filter(Phase::HeaderFilter, &mut ctx).await;
        PhaseExecutor::run_filter(Phase::BodyFilter, &mut ctx).await;

        let response = assemble_response(&ctx);

        self.finish(ctx, from_upstream).await;
        response
    }

    /// Log phase, passive health, metrics, context release
    async fn finish(&self, mut ctx: Box<RequestContext>, from_upstream: bool) {
        PhaseExecutor::run_filter(Phase::Log, &mut ctx).await;

        if from_upstream {
            self.selector.report(&ctx, ctx.resp_status);
        }

        let route_id = ctx.route.as_ref().map(|r| r.id.clone());
        self.metrics
            .record_request(ctx.resp_status, route_id.as_deref());

        tracing::info!(
            method = ctx.vars.method,
            uri = ctx.vars.uri,
            status = ctx.resp_status,
            route = route_id.as_deref().unwrap_or("-"),
            conf_version = ctx.conf_version().unwrap_or("-"),
            latency_ms = ctx.started_at.elapsed().as_millis() as u64,
            "request completed"
        );

        self.pool.release(ctx);
    }

    /// Attempt loop over the committed upstream. Each attempt re-runs
    /// the balancer phase; retryable failures move to another node while
    /// the budget lasts.
    async fn forward_with_retries(
        &self,
        ctx: &mut RequestContext,
        method: &http::Method,
        headers: &http::HeaderMap,
        raw_query: Option<&str>,
        body: Bytes,
    ) -> Result<ForwardOutcome, (u16, Bytes)> {
        let conf = ctx.upstream.clone().expect("upstream committed");
        let retries = UpstreamSelector::retries(&conf);
        let timeout = Duration::from_secs_f64(conf.upstream.timeout.read.max(0.05));

        let mut last_error: Option<ForwardError> = None;

        for attempt in 0..=retries {
            let node = match self.selector.pick(ctx) {
                Ok(node) => node,
                Err(e) => {
                    return Err((500, Bytes::from(format!(r#"{{"error_msg":"{}"}}"#, e))));
                }
            };
            PhaseExecutor::run_balancer(ctx).await;

            let path = ctx
                .upstream_uri
                .clone()
                .unwrap_or_else(|| ctx.vars.uri.clone());
            let path_and_query = match raw_query {
                Some(q) => format!("{}?{}", path, q),
                None => path,
            };

            match self
                .forwarder
                .forward(
                    &node,
                    method,
                    &path_and_query,
                    headers,
                    ctx.upstream_host.as_deref(),
                    body.clone(),
                    timeout,
                )
                .await
            {
                Ok(outcome) => {
                    let retry_status = conf
                        .upstream
                        .retry_statuses
                        .as_ref()
                        .map(|codes| codes.contains(&outcome.status))
                        .unwrap_or(false);
                    if retry_status && attempt < retries {
                        tracing::debug!(
                            node = node.address(),
                            status = outcome.status,
                            "Retrying on configured upstream status"
                        );
                        self.selector.report(ctx, outcome.status);
                        continue;
                    }
                    return Ok(outcome);
                }
                Err(err) => {
                    tracing::warn!(
                        node = node.address(),
                        attempt,
                        error = %err,
                        "Upstream attempt failed"
                    );
                    let retryable = err.is_retryable();
                    last_error = Some(err);
                    if retryable && attempt < retries {
                        continue;
                    }
                    break;
                }
            }
        }

        let (status, cause) = match &last_error {
            Some(ForwardError::Timeout(cause)) => (504, cause.clone()),
            Some(err) => (502, err.to_string()),
            None => (502, "exhausted upstream attempts".to_string()),
        };
        Err((
            status,
            Bytes::from(format!(
                r#"{{"error_msg":"upstream unavailable: {}"}}"#,
                cause
            )),
        ))
    }

    /// Tunnel a websocket upgrade: relay the handshake to the picked
    /// node, hand its 101 back, then splice bytes in both directions.
    async fn tunnel_websocket(
        &self,
        req: hyper::Request<Incoming>,
        raw_query: Option<String>,
        mut ctx: Box<RequestContext>,
    ) -> hyper::Response<Full<Bytes>> {
        let node = match self.selector.pick(&mut ctx) {
            Ok(node) => node,
            Err(e) => {
                ctx.resp_status = 502;
                let resp = simple_response(502, format!(r#"{{"error_msg":"{}"}}"#, e));
                self.finish(ctx, false).await;
                return resp;
            }
        };
        PhaseExecutor::run_balancer(&mut ctx).await;

        let mut upstream = match tokio::net::TcpStream::connect((node.host.as_str(), node.port))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.selector.report(&ctx, 502);
                ctx.resp_status = 502;
                let resp =
                    simple_response(502, format!(r#"{{"error_msg":"connect failed: {}"}}"#, e));
                self.finish(ctx, false).await;
                return resp;
            }
        };

        // Relay the client handshake verbatim, host override honored
        let path = ctx
            .upstream_uri
            .clone()
            .unwrap_or_else(|| ctx.vars.uri.clone());
        let path_and_query = match &raw_query {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };
        let mut head = format!("GET {} HTTP/1.1\r\n", path_and_query);
        for (name, value) in req.headers() {
            if name == &http::header::HOST {
                continue;
            }
            if let Ok(v) = value.to_str() {
                head.push_str(&format!("{}: {}\r\n", name, v));
            }
        }
        let host = ctx.upstream_host.clone().unwrap_or_else(|| node.address());
        head.push_str(&format!("Host: {}\r\n\r\n", host));

        if let Err(e) = upstream.write_all(head.as_bytes()).await {
            ctx.resp_status = 502;
            let resp = simple_response(502, format!(r#"{{"error_msg":"handshake write: {}"}}"#, e));
            self.finish(ctx, false).await;
            return resp;
        }

        // Read the upstream handshake response head
        let (status, resp_headers, leftover) = match read_response_head(&mut upstream).await {
            Ok(parsed) => parsed,
            Err(e) => {
                ctx.resp_status = 502;
                let resp = simple_response(502, format!(r#"{{"error_msg":"{}"}}"#, e));
                self.finish(ctx, false).await;
                return resp;
            }
        };

        let mut builder = hyper::Response::builder().status(status);
        for (name, value) in &resp_headers {
            builder = builder.header(name, value);
        }
        let response = builder.body(Full::new(Bytes::new())).unwrap_or_else(|_| {
            simple_response(502, r#"{"error_msg":"bad upstream handshake"}"#.to_string())
        });

        if status == 101 {
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        let mut client = hyper_util::rt::TokioIo::new(upgraded);
                        if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                            return;
                        }
                        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Client upgrade never completed");
                    }
                }
            });
        }

        ctx.resp_status = status;
        self.finish(ctx, true).await;
        response
    }
}

/// Fill request variables from the request head
fn build_vars(
    vars: &mut RequestVars,
    req: &hyper::Request<Incoming>,
    remote: SocketAddr,
    delete_uri_tail_slash: bool,
) {
    let uri = req.uri();
    let mut path = uri.path().to_string();
    if delete_uri_tail_slash && path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    vars.uri = path;
    vars.method = req.method().as_str().to_string();
    vars.remote_addr = Some(remote.ip());

    vars.host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .or_else(|| uri.host().map(str::to_string));

    if let Some(query) = uri.query() {
        vars.set_query(query);
    }

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            vars.headers
                .insert(header_var_name(name.as_str()), v.to_string());
        }
    }

    if let Some(cookie) = req
        .headers()
        .get(http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
    {
        vars.set_cookies(cookie);
    }
}

fn wants_websocket(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn assemble_response(ctx: &RequestContext) -> hyper::Response<Full<Bytes>> {
    let status = if ctx.resp_status == 0 {
        500
    } else {
        ctx.resp_status
    };
    let mut builder = hyper::Response::builder().status(status);
    for (name, value) in &ctx.resp_headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(ctx.resp_body.clone().unwrap_or_default()))
        .unwrap_or_else(|_| {
            simple_response(500, r#"{"error_msg":"internal server error"}"#.into())
        })
}

fn simple_response(status: u16, body: String) -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}

/// Read an HTTP/1.1 response head off a raw stream; returns
/// (status, headers, leftover bytes already read past the head)
async fn read_response_head(
    stream: &mut tokio::net::TcpStream,
) -> std::result::Result<(u16, http::HeaderMap, Vec<u8>), String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| format!("handshake read: {}", e))?;
        if n == 0 {
            return Err("upstream closed during handshake".to_string());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > 16 * 1024 {
            return Err("oversized handshake response".to_string());
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]);
    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or("empty handshake response")?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or("malformed status line")?;

    let mut headers = http::HeaderMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::from_bytes(name.trim().as_bytes()),
                http::HeaderValue::from_str(value.trim()),
            ) {
                headers.insert(name, value);
            }
        }
    }

    Ok((status, headers, buf[head_end + 4..].to_vec()))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 101 X\r\n\r\nrest"), Some(14));
        assert_eq!(find_head_end(b"partial\r\n"), None);
    }

    #[test]
    fn test_wants_websocket() {
        let mut headers = http::HeaderMap::new();
        assert!(!wants_websocket(&headers));
        headers.insert(http::header::UPGRADE, "websocket".parse().unwrap());
        assert!(wants_websocket(&headers));
        headers.insert(http::header::UPGRADE, "WebSocket".parse().unwrap());
        assert!(wants_websocket(&headers));
        headers.insert(http::header::UPGRADE, "h2c".parse().unwrap());
        assert!(!wants_websocket(&headers));
    }
}

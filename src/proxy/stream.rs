//! L4 (stream) proxy — TCP forwarding for stream routes
//!
//! Each configured stream listener accepts connections, matches them on
//! listener port and client address, runs the preread plugin chain, then
//! splices bytes to a selected upstream node. A preread short-circuit
//! rejects the connection without contacting an upstream.

use crate::ctx::ContextPool;
use crate::plugin::{Phase, PhaseExecutor, PluginRegistry};
use crate::router::StreamRouter;
use crate::store::{ConfigStore, Kind};
use crate::upstream::UpstreamSelector;
use arc_swap::ArcSwap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// TCP proxy over the stream-route collection
pub struct StreamProxy {
    store: Arc<ConfigStore>,
    router: ArcSwap<StreamRouter>,
    selector: Arc<UpstreamSelector>,
    registry: Arc<PluginRegistry>,
    pool: ContextPool,
}

impl StreamProxy {
    pub fn new(
        store: Arc<ConfigStore>,
        selector: Arc<UpstreamSelector>,
        registry: Arc<PluginRegistry>,
    ) -> Arc<Self> {
        let proxy = Arc::new(Self {
            router: ArcSwap::from_pointee(StreamRouter::build(&store.stream_routes())),
            store: store.clone(),
            selector,
            registry,
            pool: ContextPool::new(256),
        });

        let weak = Arc::downgrade(&proxy);
        store.on_change(Kind::StreamRoutes, move || {
            if let Some(proxy) = weak.upgrade() {
                proxy.rebuild_router();
            }
        });

        proxy
    }

    pub fn rebuild_router(&self) {
        let router = StreamRouter::build(&self.store.stream_routes());
        tracing::info!(stream_routes = router.len(), "Stream router rebuilt");
        self.router.store(Arc::new(router));
    }

    /// Accept loop for one listener port; call from a spawned task
    pub async fn serve(self: Arc<Self>, port: u16) -> crate::error::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(port, "Stream listener bound");

        loop {
            let (inbound, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(port, error = %e, "Stream accept failed");
                    continue;
                }
            };
            let proxy = self.clone();
            tokio::spawn(async move {
                proxy.handle_connection(inbound, port, peer).await;
            });
        }
    }

    async fn handle_connection(&self, mut inbound: TcpStream, port: u16, peer: SocketAddr) {
        let route = match self.router.load().find(port, peer.ip()) {
            Some(route) => route,
            None => {
                tracing::debug!(port, peer = %peer, "No stream route matched, dropping");
                return;
            }
        };

        let mut ctx = self.pool.checkout();
        ctx.store = Some(self.store.clone());
        ctx.vars.remote_addr = Some(peer.ip());
        if let Some(plugins) = &route.plugins {
            ctx.plugins = self.registry.build_chain(plugins);
        }

        // Preread chain; a short-circuit rejects the connection
        if let Some((status, _)) = PhaseExecutor::run_entry(Phase::Preread, &mut ctx).await {
            tracing::debug!(stream_route = route.id, status, "Preread rejected connection");
            ctx.resp_status = status;
            self.finish(ctx).await;
            return;
        }

        let conf = match self.selector.resolve_stream(&route).await {
            Ok(conf) => conf,
            Err(e) => {
                tracing::warn!(stream_route = route.id, error = %e, "Stream upstream unresolvable");
                self.finish(ctx).await;
                return;
            }
        };
        ctx.upstream = Some(conf);

        let node = match self.selector.pick(&mut ctx) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(stream_route = route.id, error = %e, "Stream node pick failed");
                self.finish(ctx).await;
                return;
            }
        };
        PhaseExecutor::run_balancer(&mut ctx).await;

        let mut outbound = match TcpStream::connect((node.host.as_str(), node.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(node = node.address(), error = %e, "Stream connect failed");
                self.selector.report(&ctx, 502);
                ctx.resp_status = 502;
                self.finish(ctx).await;
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
            Ok((tx, rx)) => {
                tracing::debug!(
                    stream_route = route.id,
                    node = node.address(),
                    bytes_up = tx,
                    bytes_down = rx,
                    "Stream session closed"
                );
                ctx.resp_status = 200;
                self.selector.report(&ctx, 200);
            }
            Err(e) => {
                tracing::debug!(node = node.address(), error = %e, "Stream session errored");
                ctx.resp_status = 502;
                self.selector.report(&ctx, 502);
            }
        }

        self.finish(ctx).await;
    }

    async fn finish(&self, mut ctx: Box<crate::ctx::RequestContext>) {
        PhaseExecutor::run_filter(Phase::Log, &mut ctx).await;
        self.pool.release(ctx);
    }

    /// Listener ports the current snapshot wants served
    pub fn ports(&self) -> Vec<u16> {
        self.router.load().ports()
    }
}

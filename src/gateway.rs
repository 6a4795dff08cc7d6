//! Gateway orchestrator — wires the snapshot store, routers, plugin
//! host, upstream selector, and listeners into a single manageable unit.

use crate::config::{ConfigSource, GatewayConfig};
use crate::error::Result;
use crate::metrics::GatewayMetrics;
use crate::plugin::PluginRegistry;
use crate::proxy::stream::StreamProxy;
use crate::proxy::ProxyEngine;
use crate::store::watch::{self, WatchSource, YamlSource};
use crate::store::ConfigStore;
use crate::upstream::{ActiveProber, SystemResolver, UpstreamSelector};
use crate::{GatewayState, HealthStatus};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// The main gateway — coordinates all components
pub struct Gateway {
    config: Arc<RwLock<GatewayConfig>>,
    store: Arc<ConfigStore>,
    selector: Arc<UpstreamSelector>,
    engine: Arc<ProxyEngine>,
    stream_proxy: Arc<StreamProxy>,
    metrics: Arc<GatewayMetrics>,
    state: Arc<RwLock<GatewayState>>,
    start_time: Instant,
    shutdown: Arc<AtomicBool>,
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl Gateway {
    /// Create a gateway from static configuration
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ConfigStore::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let registry = Arc::new(PluginRegistry::with_builtins());
        let selector = Arc::new(UpstreamSelector::new(
            store.clone(),
            Arc::new(SystemResolver),
            Duration::from_secs(config.dns_resolver_valid),
        ));

        let engine = ProxyEngine::new(
            store.clone(),
            selector.clone(),
            registry.clone(),
            metrics.clone(),
            config.server_header(),
            config.delete_uri_tail_slash,
        );
        let stream_proxy = StreamProxy::new(store.clone(), selector.clone(), registry);

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            store,
            selector,
            engine,
            stream_proxy,
            metrics,
            state: Arc::new(RwLock::new(GatewayState::Created)),
            start_time: Instant::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: RwLock::new(Vec::new()),
        })
    }

    /// Start the gateway: watch source, health prober, and listeners
    pub async fn start(&self) -> Result<()> {
        self.set_state(GatewayState::Starting);
        let config = self.config.read().unwrap().clone();

        let mut handles = Vec::new();

        // Dynamic-config pump
        let source: Arc<dyn WatchSource> = match &config.config_source {
            ConfigSource::Yaml { path } => Arc::new(YamlSource::new(path)),
        };
        tracing::info!(source = ?config.config_source, "Watching dynamic configuration");
        handles.push(tokio::spawn(watch::pump(source, self.store.clone())));

        // Active health probing
        let prober = Arc::new(ActiveProber::new(
            self.store.clone(),
            self.selector.health.clone(),
        ));
        handles.push(tokio::spawn(prober.run()));

        // HTTP listener
        let addr: SocketAddr = config.listen.parse().expect("validated listen address");
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(address = %addr, "HTTP listener bound");
        handles.push(tokio::spawn(serve_http(listener, self.engine.clone())));

        // HTTPS listener with snapshot-driven certificates
        if let Some(tls_addr) = &config.tls_listen {
            let addr: SocketAddr = tls_addr.parse().expect("validated tls_listen address");
            let listener = TcpListener::bind(addr).await?;
            let acceptor = crate::tls::build_dynamic_acceptor(self.store.clone());
            tracing::info!(address = %addr, "HTTPS listener bound");
            handles.push(tokio::spawn(serve_https(
                listener,
                acceptor,
                self.engine.clone(),
            )));
        }

        // Stream (L4) listeners
        for port in &config.stream_listen {
            let proxy = self.stream_proxy.clone();
            let port = *port;
            handles.push(tokio::spawn(async move {
                if let Err(e) = proxy.serve(port).await {
                    tracing::error!(port, error = %e, "Stream listener failed");
                }
            }));
        }

        *self.handles.write().unwrap() = handles;
        self.set_state(GatewayState::Running);
        tracing::info!("Gateway is running");
        Ok(())
    }

    /// Reload static configuration without dropping the process.
    /// Listeners are rebound; dynamic state derivations are invalidated
    /// and recompiled from the current snapshots.
    pub async fn reload(&self, new_config: GatewayConfig) -> Result<()> {
        new_config.validate()?;
        self.set_state(GatewayState::Reloading);
        tracing::info!("Reloading gateway configuration");

        {
            let mut handles = self.handles.write().unwrap();
            for handle in handles.drain(..) {
                handle.abort();
            }
        }

        self.selector.invalidate_derivations();
        self.engine.rebuild_router();
        self.stream_proxy.rebuild_router();

        *self.config.write().unwrap() = new_config;
        self.start().await
    }

    /// Initiate graceful shutdown
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.set_state(GatewayState::Stopping);
        tracing::info!("Gateway shutting down");

        let mut handles = self.handles.write().unwrap();
        for handle in handles.drain(..) {
            handle.abort();
        }

        self.set_state(GatewayState::Stopped);
        tracing::info!("Gateway stopped");
    }

    pub fn state(&self) -> GatewayState {
        self.state.read().unwrap().clone()
    }

    /// Health snapshot surfaced to operators
    pub fn health(&self) -> HealthStatus {
        let snapshot = self.metrics.snapshot();
        HealthStatus {
            state: self.state(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            config_store_healthy: self.store.healthy(),
            active_connections: snapshot.active_connections.max(0) as usize,
            total_requests: snapshot.total_requests,
        }
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn config(&self) -> GatewayConfig {
        self.config.read().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == GatewayState::Running
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn set_state(&self, new_state: GatewayState) {
        let mut state = self.state.write().unwrap();
        tracing::debug!(from = %*state, to = %new_state, "State transition");
        *state = new_state;
    }
}

/// Accept loop for plain HTTP connections
async fn serve_http(listener: TcpListener, engine: Arc<ProxyEngine>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                continue;
            }
        };

        let engine = engine.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let engine = engine.clone();
                async move { Ok::<_, hyper::Error>(engine.handle(req, remote).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                tracing::debug!(error = %e, "Connection closed with error");
            }
        });
    }
}

/// Accept loop for TLS connections; certificate selection happens per
/// handshake against the live ssl snapshot
async fn serve_https(
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    engine: Arc<ProxyEngine>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "TLS accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::debug!(error = %e, "TLS handshake failed");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = service_fn(move |req| {
                let engine = engine.clone();
                async move { Ok::<_, hyper::Error>(engine.handle(req, remote).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                tracing::debug!(error = %e, "TLS connection closed with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> GatewayConfig {
        GatewayConfig {
            listen: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_gateway_new() {
        let gw = Gateway::new(minimal_config()).unwrap();
        assert_eq!(gw.state(), GatewayState::Created);
        assert!(!gw.is_running());
        assert!(!gw.is_shutdown());
    }

    #[test]
    fn test_gateway_new_invalid_config() {
        let config = GatewayConfig {
            listen: "bogus".to_string(),
            ..Default::default()
        };
        assert!(Gateway::new(config).is_err());
    }

    #[test]
    fn test_gateway_health_initial() {
        let gw = Gateway::new(minimal_config()).unwrap();
        let health = gw.health();
        assert_eq!(health.state, GatewayState::Created);
        assert_eq!(health.total_requests, 0);
        assert!(health.config_store_healthy);
    }

    #[tokio::test]
    async fn test_gateway_shutdown_idempotent() {
        let gw = Gateway::new(minimal_config()).unwrap();
        gw.shutdown().await;
        gw.shutdown().await;
        assert_eq!(gw.state(), GatewayState::Stopped);
        assert!(gw.is_shutdown());
    }

    #[test]
    fn test_gateway_config_accessor() {
        let gw = Gateway::new(minimal_config()).unwrap();
        assert_eq!(gw.config().listen, "127.0.0.1:0");
    }
}

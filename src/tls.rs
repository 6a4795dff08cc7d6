//! TLS termination with dynamic SNI certificates
//!
//! The handshake consults the live ssl collection through an SNI
//! sub-router, so certificates rotate with config changes and no
//! restart. Parsed keys are cached per (entity, version). A handshake
//! whose server name matches no certificate is aborted.

use crate::error::{GatewayError, Result};
use crate::router::SniRouter;
use crate::store::{ConfigStore, Ssl};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Certificate resolver backed by the config snapshot store
pub struct DynamicCertResolver {
    router: ArcSwap<SniRouter>,
    store: Arc<ConfigStore>,
    /// Parsed keys per ssl id, keyed off the entity version
    parsed: DashMap<String, (u64, Arc<CertifiedKey>)>,
}

impl DynamicCertResolver {
    pub fn new(store: Arc<ConfigStore>) -> Arc<Self> {
        let resolver = Arc::new(Self {
            router: ArcSwap::from_pointee(SniRouter::build(&store.ssls())),
            store: store.clone(),
            parsed: DashMap::new(),
        });

        let weak = Arc::downgrade(&resolver);
        store.on_change(crate::store::Kind::Ssls, move || {
            if let Some(resolver) = weak.upgrade() {
                resolver.rebuild();
            }
        });

        resolver
    }

    /// Recompile the SNI router from the current snapshot
    pub fn rebuild(&self) {
        let router = SniRouter::build(&self.store.ssls());
        tracing::info!(certificates = router.len(), "SNI certificate table rebuilt");
        self.router.store(Arc::new(router));
    }

    fn certified(&self, ssl: &Arc<Ssl>) -> Result<Arc<CertifiedKey>> {
        if let Some(entry) = self.parsed.get(&ssl.id) {
            if entry.0 == ssl.version {
                return Ok(entry.1.clone());
            }
        }

        let key = parse_certified_key(&ssl.cert, &ssl.key)?;
        self.parsed
            .insert(ssl.id.clone(), (ssl.version, key.clone()));
        Ok(key)
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("certificates", &self.router.load().len())
            .finish()
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = match client_hello.server_name() {
            Some(sni) => sni.to_string(),
            None => {
                tracing::debug!("TLS handshake without SNI rejected");
                return None;
            }
        };

        let ssl = match self.router.load().find(&sni) {
            Some(ssl) => ssl,
            None => {
                tracing::debug!(sni, "No certificate matched SNI, aborting handshake");
                return None;
            }
        };

        match self.certified(&ssl) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(ssl = ssl.id, error = %e, "Certificate entity unusable");
                None
            }
        }
    }
}

/// Build a TLS acceptor whose certificate selection is snapshot-driven
pub fn build_dynamic_acceptor(store: Arc<ConfigStore>) -> TlsAcceptor {
    let resolver = DynamicCertResolver::new(store);
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    TlsAcceptor::from(Arc::new(config))
}

/// Parse PEM cert chain + key into a rustls certified key
fn parse_certified_key(cert_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>> {
    let mut cert_reader = BufReader::new(cert_pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("Failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::Tls("No certificates in PEM".to_string()));
    }

    let mut key_reader = BufReader::new(key_pem.as_bytes());
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| GatewayError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| GatewayError::Tls("No private key in PEM".to_string()))?;

    let signing_key = any_supported_type(&key)
        .map_err(|e| GatewayError::Tls(format!("Unsupported private key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

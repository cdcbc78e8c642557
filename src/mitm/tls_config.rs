//! TLS Configuration for interception
//!
//! This module provides TLS configurations for:
//! - Client-facing TLS (proxy ← client) presenting a minted host identity
//! - Upstream TLS (proxy → upstream) with real verification
//!
//! Both sides speak TLS 1.2 and 1.3 only.

use super::error::{MitmError, Result};
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::sync::Arc;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&TLS12, &TLS13];

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

/// Certificate resolver that always answers with the same identity
///
/// SNI, offered signature schemes and acceptable issuers from the client
/// hello are ignored.
#[derive(Debug)]
pub struct ForcedIdentityResolver {
    certified_key: Arc<CertifiedKey>,
}

impl ForcedIdentityResolver {
    pub fn new(certified_key: Arc<CertifiedKey>) -> Self {
        Self { certified_key }
    }
}

impl ResolvesServerCert for ForcedIdentityResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.certified_key))
    }
}

/// Client-facing TLS config (proxy acts as server with a minted identity)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build a server config that always presents `cert_chain` (leaf first)
    pub fn for_identity(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let provider = crypto_provider();

        let signing_key = provider
            .key_provider
            .load_private_key(private_key)
            .map_err(|e| MitmError::TlsConfigFailed(format!("unusable private key: {}", e)))?;
        let certified_key = Arc::new(CertifiedKey::new(cert_chain, signing_key));

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ForcedIdentityResolver::new(certified_key)));

        // Intercepted exchanges are relayed as HTTP/1.1
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client with real verification)
#[derive(Clone)]
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Build client config trusting the Mozilla root bundle
    pub fn new() -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

        let config = Self::build(root_store)?;

        debug!(
            roots_count = TLS_SERVER_ROOTS.len(),
            "Upstream TLS config created"
        );

        Ok(config)
    }

    /// Build client config trusting only the given roots
    pub fn with_root_certificates(roots: &[CertificateDer<'static>]) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        for root in roots {
            root_store
                .add(root.clone())
                .map_err(|e| MitmError::TlsConfigFailed(format!("bad trust anchor: {}", e)))?;
        }

        Self::build(root_store)
    }

    fn build(root_store: RootCertStore) -> Result<Self> {
        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// Server name used for SNI and certificate verification of `host`
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| MitmError::tls_handshake(host, format!("invalid server name: {}", e)))
}

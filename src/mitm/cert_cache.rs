//! Host Certificate Cache
//!
//! Maps a host name to the TLS identity presented to clients tunnelling to
//! that host. Identities are issued on first use and kept for the life of the
//! process. Concurrent first requests for the same host share one issuance;
//! different hosts never wait on each other.

use super::certificate_authority::{self, CertificateKeyPair};
use super::error::{MitmError, Result};
use super::keystore::AuthorityChain;
use super::tls_config::ClientTlsConfig;
use dashmap::DashMap;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Leaf certificate, chain and server context for one host
pub struct HostIdentity {
    host: String,
    leaf: CertificateKeyPair,
    chain: Vec<CertificateDer<'static>>,
    server_config: Arc<ServerConfig>,
}

impl HostIdentity {
    /// Issue a leaf for `host` from the chain's signer
    pub fn issue(host: &str, authority: &AuthorityChain) -> Result<Self> {
        let leaf = certificate_authority::issue(host, authority.signer(), true)?;

        let chain: Vec<CertificateDer<'static>> = std::iter::once(leaf.certificate().clone())
            .chain(authority.chain_certificates())
            .collect();

        let server_config =
            ClientTlsConfig::for_identity(chain.clone(), leaf.private_key_der())?.server_config();

        Ok(Self {
            host: host.to_string(),
            leaf,
            chain,
            server_config,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn leaf(&self) -> &CertificateKeyPair {
        &self.leaf
    }

    /// `[leaf, signer, ..., root]`
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Server context that presents this identity whatever the client asks for
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

impl std::fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentity")
            .field("host", &self.host)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Hosts with an issued identity
    pub hosts: usize,
    pub hits: u64,
    pub misses: u64,
    /// Leaves minted since startup
    pub issued: u64,
}

impl CacheStats {
    /// Hits over total lookups
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-host identity cache with single-flight issuance
///
/// There is no eviction: memory grows with the number of distinct hosts seen.
pub struct HostCertificateCache {
    authority: Arc<AuthorityChain>,
    identities: DashMap<String, Arc<OnceCell<Arc<HostIdentity>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    issued: AtomicU64,
}

impl HostCertificateCache {
    pub fn new(authority: AuthorityChain) -> Self {
        Self {
            authority: Arc::new(authority),
            identities: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            issued: AtomicU64::new(0),
        }
    }

    /// The chain every leaf is issued under
    pub fn authority(&self) -> &AuthorityChain {
        &self.authority
    }

    /// Identity for `host`, issuing it on first use
    ///
    /// A failed issuance stores nothing; the next call for the host retries.
    pub async fn get_identity(&self, host: &str) -> Result<Arc<HostIdentity>> {
        // Shard lock is released at the end of this statement
        let cell = self
            .identities
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(identity) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(host = %host, "Identity cache hit");
            return Ok(Arc::clone(identity));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match cell.get_or_try_init(|| self.issue(host)).await {
            Ok(identity) => Ok(Arc::clone(identity)),
            Err(e) => {
                // Drop the empty cell unless a concurrent caller has since filled it
                self.identities.remove_if(host, |_, cell| !cell.initialized());
                Err(e)
            }
        }
    }

    async fn issue(&self, host: &str) -> Result<Arc<HostIdentity>> {
        let authority = Arc::clone(&self.authority);
        let owned_host = host.to_string();

        let identity =
            tokio::task::spawn_blocking(move || HostIdentity::issue(&owned_host, &authority))
                .await
                .map_err(|e| MitmError::cert_generation(host, format!("issuance task failed: {}", e)))??;

        self.issued.fetch_add(1, Ordering::Relaxed);
        info!(host = %host, chain_len = identity.chain().len(), "Leaf certificate issued");

        Ok(Arc::new(identity))
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hosts: self
                .identities
                .iter()
                .filter(|entry| entry.value().initialized())
                .count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            issued: self.issued.load(Ordering::Relaxed),
        }
    }
}

//! Interloper - TLS-intercepting forward HTTP proxy
//!
//! Interloper accepts HTTP/1.1 proxy connections, relays plain requests to
//! their origin and, on `CONNECT`, terminates the client's TLS with a leaf
//! certificate minted on demand for the requested host, opening its own TLS
//! connection to the real server and relaying the decrypted exchange.
//!
//! ## Features
//!
//! - **Authority chain**: root, intermediates and signer loaded from a
//!   password-sealed certificate store
//! - **On-demand leaf issuance**: one certificate per host, issued once and
//!   cached for the life of the process
//! - **Streaming HTTP/1.1**: bounded header parsing, chunked and
//!   `Content-Length` body tracking, keep-alive, byte-exact relay
//!
//! ## Usage
//!
//! ```rust,no_run
//! use interloper::{
//!     AuthorityChain, CertificateStore, ConnectionEngine, EngineConfig,
//!     HostCertificateCache, ProxyServer, UpstreamTlsConfig,
//! };
//! use secrecy::SecretString;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let password = SecretString::new("changeit".to_string());
//!     let store = CertificateStore::open("proxy.keystore", &password)?;
//!     let chain = AuthorityChain::load(&store, &["root".to_string(), "signer".to_string()])?;
//!
//!     let engine = ConnectionEngine::new(
//!         Arc::new(HostCertificateCache::new(chain)),
//!         UpstreamTlsConfig::new()?,
//!         EngineConfig::default(),
//!     );
//!
//!     ProxyServer::bind("127.0.0.1:3128", Arc::new(engine)).await?.run().await
//! }
//! ```

pub mod config;
pub mod mitm;
pub mod server;

// Re-export commonly used types

/// Configuration types
pub use config::Config;

/// Listener
pub use server::ProxyServer;

/// MITM types and functionality
pub use mitm::{
    // Authority chain and certificate store
    bootstrap_chain,
    AuthorityChain,
    // Per-host identities
    CacheStats,
    CertificateKeyPair,
    CertificateStore,
    ChainLink,
    // Stream processing
    ChunkedDecoder,
    ClientTlsConfig,
    // Connection engine
    ConnectionEngine,
    EngineConfig,
    ErrorKind,
    HeaderMessage,
    HeaderProcessor,
    HostCertificateCache,
    HostIdentity,
    MessageKind,
    MitmError,
    StoreEntry,
    UpstreamTlsConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides TLS interception for a forward proxy.
//! It includes:
//! - Authority chain loading from a password-protected certificate store
//! - On-demand leaf certificate issuance, cached per host
//! - TLS handshake handling (client and upstream)
//! - Streaming HTTP/1.1 header and chunked-body processing
//! - The per-connection relay engine

pub mod cert_cache;
pub mod certificate_authority;
pub mod chunked;
pub mod error;
pub mod http_parser;
pub mod interceptor;
pub mod keystore;
pub mod stream;
pub mod tls_config;

// Re-export main types
pub use cert_cache::{CacheStats, HostCertificateCache, HostIdentity};
pub use certificate_authority::CertificateKeyPair;
pub use chunked::{ChunkedDecoder, DecoderMode};
pub use error::{ErrorKind, MitmError, Result};
pub use http_parser::{
    HeaderFields, HeaderMessage, HeaderProcessor, MessageKind, RequestLine, StartLine, StatusLine,
};
pub use interceptor::{parse_authority, BodyFraming, ConnectionEngine, EngineConfig};
pub use keystore::{bootstrap_chain, AuthorityChain, CertificateStore, ChainLink, StoreEntry};
pub use stream::{AsyncStream, BoxedStream, PrefixedStream};
pub use tls_config::{ClientTlsConfig, ForcedIdentityResolver, UpstreamTlsConfig};

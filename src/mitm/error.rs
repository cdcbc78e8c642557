//! MITM error types

use std::time::Duration;
use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// Coarse classification of a [`MitmError`]
///
/// Protocol, certificate-at-request-time and connection errors end only the
/// connection that raised them. Config errors (and certificate errors raised
/// while loading the authority chain) prevent startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Certificate,
    Connection,
    Config,
}

/// MITM-specific errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// Malformed start line, header line, chunk-size line or trailer line
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Certificate store entry missing or of the wrong type
    #[error("Invalid certificate store entry '{alias}': {reason}")]
    InvalidStoreEntry { alias: String, reason: String },

    /// Certificate generation or signing failed
    #[error("Failed to generate certificate for {common_name}: {detail}")]
    CertGenerationFailed {
        common_name: String,
        detail: String,
    },

    /// Certificate parsing failed
    #[error("Failed to parse certificate: {0}")]
    CertParseFailed(String),

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// TLS handshake failed
    #[error("TLS handshake failed for {host}: {detail}")]
    TlsHandshakeFailed { host: String, detail: String },

    /// Upstream connection failed
    #[error("Upstream connection failed for {host}: {detail}")]
    UpstreamConnectionFailed { host: String, detail: String },

    /// A socket operation exceeded the idle timeout
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Peer closed the transport in the middle of a message
    #[error("{peer} closed the connection mid-message")]
    UnexpectedEof { peer: &'static str },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad store path, password, alias list or environment value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MitmError {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a store entry error
    pub fn store_entry(alias: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStoreEntry {
            alias: alias.into(),
            reason: reason.into(),
        }
    }

    /// Create a certificate generation error
    pub fn cert_generation(common_name: impl Into<String>, msg: impl ToString) -> Self {
        Self::CertGenerationFailed {
            common_name: common_name.into(),
            detail: msg.to_string(),
        }
    }

    /// Create a TLS handshake error
    pub fn tls_handshake(host: impl Into<String>, msg: impl ToString) -> Self {
        Self::TlsHandshakeFailed {
            host: host.into(),
            detail: msg.to_string(),
        }
    }

    /// Create an upstream connection error
    pub fn upstream(host: impl Into<String>, msg: impl ToString) -> Self {
        Self::UpstreamConnectionFailed {
            host: host.into(),
            detail: msg.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Which part of the error taxonomy this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::InvalidStoreEntry { .. }
            | Self::CertGenerationFailed { .. }
            | Self::CertParseFailed(_)
            | Self::TlsConfigFailed(_) => ErrorKind::Certificate,
            Self::TlsHandshakeFailed { .. }
            | Self::UpstreamConnectionFailed { .. }
            | Self::Timeout { .. }
            | Self::UnexpectedEof { .. }
            | Self::Io(_) => ErrorKind::Connection,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

//! Certificate store and authority chain loading
//!
//! The store is a JSON document of named entries, sealed with a password:
//!
//! ```json
//! {
//!   "format": "interloper-keystore-v1",
//!   "integrity": "<base64 sha256>",
//!   "entries": {
//!     "root": { "kind": "private_key", "chain_pem": ["..."], "key_pem": "..." },
//!     "ca":   { "kind": "trusted_certificate", "certificate_pem": "..." }
//!   }
//! }
//! ```
//!
//! The integrity digest is SHA-256 over the password, a fixed whitener and
//! the serialized entries. Opening with the wrong password, or opening a file
//! edited by hand, fails.
//!
//! The password gives integrity only. Private keys are written as plain
//! PKCS#8 PEM, so anyone who can read the file holds the authority keys.
//! Restrict the file's permissions accordingly.

use super::certificate_authority::{self, CertificateKeyPair};
use super::error::{MitmError, Result};
use base64::Engine;
use rcgen::KeyPair;
use rustls::pki_types::CertificateDer;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Format marker written to every store
pub const STORE_FORMAT: &str = "interloper-keystore-v1";

const INTEGRITY_WHITENER: &[u8] = b"interloper certificate store";

/// One named entry of the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreEntry {
    /// Certificate chain (own certificate first) plus its PKCS#8 key
    PrivateKey {
        chain_pem: Vec<String>,
        key_pem: String,
    },
    /// A certificate without key material
    TrustedCertificate { certificate_pem: String },
}

#[derive(Serialize, Deserialize)]
struct StoreDocument {
    format: String,
    integrity: String,
    entries: BTreeMap<String, StoreEntry>,
}

/// Integrity-sealed collection of named certificate entries
///
/// Key material is stored unencrypted; see the module docs.
pub struct CertificateStore {
    password: SecretString,
    entries: BTreeMap<String, StoreEntry>,
}

impl CertificateStore {
    /// Empty store protected by `password`
    pub fn new(password: &SecretString) -> Self {
        Self {
            password: SecretString::new(password.expose_secret().clone()),
            entries: BTreeMap::new(),
        }
    }

    /// Read and verify a store file
    pub fn open(path: impl AsRef<Path>, password: &SecretString) -> Result<Self> {
        let path = path.as_ref();

        let raw = std::fs::read(path).map_err(|e| {
            MitmError::config(format!(
                "cannot read certificate store {}: {}",
                path.display(),
                e
            ))
        })?;

        let document: StoreDocument = serde_json::from_slice(&raw).map_err(|e| {
            MitmError::config(format!(
                "certificate store {} is not valid: {}",
                path.display(),
                e
            ))
        })?;

        if document.format != STORE_FORMAT {
            return Err(MitmError::config(format!(
                "certificate store {} has unsupported format '{}'",
                path.display(),
                document.format
            )));
        }

        let store = Self {
            password: SecretString::new(password.expose_secret().clone()),
            entries: document.entries,
        };

        if store.integrity()? != document.integrity {
            return Err(MitmError::config(format!(
                "certificate store {}: password incorrect or store tampered with",
                path.display()
            )));
        }

        info!(
            path = %path.display(),
            entries = store.entries.len(),
            "Certificate store opened"
        );

        Ok(store)
    }

    /// Write the store, replacing any existing file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let document = StoreDocument {
            format: STORE_FORMAT.to_string(),
            integrity: self.integrity()?,
            entries: self.entries.clone(),
        };

        let json = serde_json::to_string_pretty(&document)
            .map_err(|e| MitmError::config(format!("cannot serialize certificate store: {}", e)))?;

        std::fs::write(path, json).map_err(|e| {
            MitmError::config(format!(
                "cannot write certificate store {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!(path = %path.display(), entries = self.entries.len(), "Certificate store saved");
        Ok(())
    }

    /// Look up an entry by alias
    pub fn entry(&self, alias: &str) -> Option<&StoreEntry> {
        self.entries.get(alias)
    }

    /// All aliases, in sorted order
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Store a key pair under `alias` with its chain (own certificate first)
    pub fn insert_private_key(
        &mut self,
        alias: impl Into<String>,
        key_pair: &CertificateKeyPair,
        chain: &[CertificateDer<'static>],
    ) {
        let chain_pem = chain
            .iter()
            .map(|cert| certificate_authority::der_to_pem("CERTIFICATE", cert.as_ref()))
            .collect();

        self.entries.insert(
            alias.into(),
            StoreEntry::PrivateKey {
                chain_pem,
                key_pem: key_pair.private_key_pem(),
            },
        );
    }

    /// Store a certificate without its key under `alias`
    pub fn insert_trusted_certificate(
        &mut self,
        alias: impl Into<String>,
        certificate: &CertificateDer<'static>,
    ) {
        self.entries.insert(
            alias.into(),
            StoreEntry::TrustedCertificate {
                certificate_pem: certificate_authority::der_to_pem(
                    "CERTIFICATE",
                    certificate.as_ref(),
                ),
            },
        );
    }

    /// Load the certificate and key stored under a private-key entry
    pub fn key_pair(&self, alias: &str) -> Result<CertificateKeyPair> {
        let (chain_pem, key_pem) = match self.entries.get(alias) {
            None => return Err(MitmError::store_entry(alias, "no such entry")),
            Some(StoreEntry::TrustedCertificate { .. }) => {
                return Err(MitmError::store_entry(alias, "not a private key entry"))
            }
            Some(StoreEntry::PrivateKey { chain_pem, key_pem }) => (chain_pem, key_pem),
        };

        let own_pem = chain_pem
            .first()
            .ok_or_else(|| MitmError::store_entry(alias, "certificate chain is empty"))?;
        let certificate = parse_certificate_pem(own_pem)?;

        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| MitmError::store_entry(alias, format!("unreadable private key: {}", e)))?;

        Ok(CertificateKeyPair::new(certificate, key_pair))
    }

    /// Load the certificate stored under a trusted-certificate entry
    pub fn trusted_certificate(&self, alias: &str) -> Result<CertificateDer<'static>> {
        match self.entries.get(alias) {
            Some(StoreEntry::TrustedCertificate { certificate_pem }) => {
                parse_certificate_pem(certificate_pem)
            }
            Some(StoreEntry::PrivateKey { .. }) => Err(MitmError::store_entry(
                alias,
                "not a trusted certificate entry",
            )),
            None => Err(MitmError::store_entry(alias, "no such entry")),
        }
    }

    fn integrity(&self) -> Result<String> {
        let entries = serde_json::to_vec(&self.entries)
            .map_err(|e| MitmError::config(format!("cannot serialize certificate store: {}", e)))?;

        let mut hasher = Sha256::new();
        hasher.update(self.password.expose_secret().as_bytes());
        hasher.update(INTEGRITY_WHITENER);
        hasher.update(&entries);

        Ok(base64::engine::general_purpose::STANDARD.encode(hasher.finalize()))
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("aliases", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Parse a single PEM certificate and check that it is valid X.509
pub fn parse_certificate_pem(pem: &str) -> Result<CertificateDer<'static>> {
    let certificate = rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .ok_or_else(|| MitmError::CertParseFailed("no PEM certificate found".to_string()))?
        .map_err(|e| MitmError::CertParseFailed(e.to_string()))?;

    X509Certificate::from_der(certificate.as_ref())
        .map_err(|e| MitmError::CertParseFailed(e.to_string()))?;

    Ok(certificate)
}

/// Ordered authority chain, root first and signer last
///
/// Only the signer issues leaves. The full chain, reversed, is attached
/// below every leaf so clients can build a path to the root.
#[derive(Debug, Clone)]
pub struct AuthorityChain {
    /// Everything above the signer, root first
    ancestors: Vec<CertificateKeyPair>,
    signer: CertificateKeyPair,
}

impl AuthorityChain {
    /// Build a chain from key pairs ordered root first
    pub fn new(mut entries: Vec<CertificateKeyPair>) -> Result<Self> {
        let signer = entries
            .pop()
            .ok_or_else(|| MitmError::config("authority chain needs at least one entry"))?;

        Ok(Self {
            ancestors: entries,
            signer,
        })
    }

    /// Load the entries named by `aliases` (root first) from a store
    pub fn load(store: &CertificateStore, aliases: &[String]) -> Result<Self> {
        if aliases.is_empty() {
            return Err(MitmError::config("no signer aliases given"));
        }

        let entries = aliases
            .iter()
            .map(|alias| store.key_pair(alias))
            .collect::<Result<Vec<_>>>()?;

        let chain = Self::new(entries)?;

        info!(
            aliases = ?aliases,
            signer = %aliases.last().map(String::as_str).unwrap_or_default(),
            "Authority chain loaded"
        );

        Ok(chain)
    }

    /// The entry that signs new leaves
    pub fn signer(&self) -> &CertificateKeyPair {
        &self.signer
    }

    /// The top of the chain
    pub fn root(&self) -> &CertificateKeyPair {
        self.ancestors.first().unwrap_or(&self.signer)
    }

    /// Number of entries in the chain
    pub fn len(&self) -> usize {
        self.ancestors.len() + 1
    }

    /// Always false, a chain holds at least its signer
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Chain certificates as attached below a leaf: signer first, root last
    pub fn chain_certificates(&self) -> Vec<CertificateDer<'static>> {
        std::iter::once(&self.signer)
            .chain(self.ancestors.iter().rev())
            .map(|pair| pair.certificate().clone())
            .collect()
    }
}

/// One `alias,commonName` step of a bootstrapped chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub alias: String,
    pub common_name: String,
}

impl FromStr for ChainLink {
    type Err = MitmError;

    fn from_str(s: &str) -> Result<Self> {
        let (alias, common_name) = s
            .split_once(',')
            .ok_or_else(|| MitmError::config(format!("expected alias,commonName but got '{}'", s)))?;

        let alias = alias.trim();
        let common_name = common_name.trim();
        if alias.is_empty() || common_name.is_empty() {
            return Err(MitmError::config(format!(
                "alias and common name must be non-empty in '{}'",
                s
            )));
        }

        Ok(Self {
            alias: alias.to_string(),
            common_name: common_name.to_string(),
        })
    }
}

/// Build a fresh authority chain and record every link in `store`
///
/// The first link is a self-signed root. Each following link is signed by the
/// one before it and can itself sign. Every alias is stored with its chain
/// `[self, ..., root]`.
pub fn bootstrap_chain(store: &mut CertificateStore, links: &[ChainLink]) -> Result<AuthorityChain> {
    if links.is_empty() {
        return Err(MitmError::config("at least one alias,commonName pair is required"));
    }

    let mut pairs: Vec<CertificateKeyPair> = Vec::with_capacity(links.len());
    // Own certificate first, root last
    let mut chain: Vec<CertificateDer<'static>> = Vec::with_capacity(links.len());

    for link in links {
        let pair = match pairs.last() {
            None => certificate_authority::self_sign(&link.common_name)?,
            Some(issuer) => certificate_authority::issue(&link.common_name, issuer, false)?,
        };

        chain.insert(0, pair.certificate().clone());
        store.insert_private_key(link.alias.clone(), &pair, &chain);

        info!(
            alias = %link.alias,
            common_name = %link.common_name,
            depth = pairs.len(),
            "Authority certificate created"
        );

        pairs.push(pair);
    }

    AuthorityChain::new(pairs)
}

//! Certificate Authority - key and certificate minting
//!
//! This module builds the certificates the proxy needs:
//! - self-signed authority roots (used by the chain bootstrap utility)
//! - issuer-signed intermediates, still able to sign other certificates
//! - issuer-signed leaf certificates presented to intercepted clients
//!
//! It holds no state. Every call draws a fresh key pair.

use super::error::{MitmError, Result};
use base64::Engine;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::sync::Arc;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Validity window of every certificate minted here
pub const VALIDITY_DAYS: i64 = 365;

/// An X.509 certificate together with its private key
///
/// Immutable once built. Cloning shares the key.
#[derive(Clone)]
pub struct CertificateKeyPair {
    certificate: CertificateDer<'static>,
    key_pair: Arc<KeyPair>,
}

impl CertificateKeyPair {
    /// Pair an existing certificate with its key
    pub fn new(certificate: CertificateDer<'static>, key_pair: KeyPair) -> Self {
        Self {
            certificate,
            key_pair: Arc::new(key_pair),
        }
    }

    /// DER-encoded certificate
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// Signing key
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// PKCS#8 private key, in the form rustls expects
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pair.serialize_der()))
    }

    /// PEM-encoded certificate
    pub fn certificate_pem(&self) -> String {
        der_to_pem("CERTIFICATE", self.certificate.as_ref())
    }

    /// PEM-encoded PKCS#8 private key
    pub fn private_key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// Subject common name of the certificate
    pub fn common_name(&self) -> Result<String> {
        let (_, cert) = X509Certificate::from_der(self.certificate.as_ref())
            .map_err(|e| MitmError::CertParseFailed(e.to_string()))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .ok_or_else(|| MitmError::CertParseFailed("subject has no common name".to_string()))?;

        Ok(common_name)
    }

    /// Rebuild an rcgen view of this certificate so it can act as an issuer
    ///
    /// Only the subject name and key identifier of the result are used when
    /// signing; the re-signed DER is discarded.
    fn as_issuer(&self) -> Result<rcgen::Certificate> {
        let params = CertificateParams::from_ca_cert_der(&self.certificate)
            .map_err(|e| MitmError::CertParseFailed(e.to_string()))?;

        params
            .self_signed(&self.key_pair)
            .map_err(|e| MitmError::CertParseFailed(e.to_string()))
    }
}

// Keep key material out of Debug output
impl fmt::Debug for CertificateKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateKeyPair")
            .field("certificate_len", &self.certificate.as_ref().len())
            .field("key_pair", &"<REDACTED>")
            .finish()
    }
}

/// Build a self-signed authority certificate with subject `CN=<common_name>`
///
/// The certificate carries basic constraints CA=true so it can sign the rest
/// of the chain.
pub fn self_sign(common_name: &str) -> Result<CertificateKeyPair> {
    let key_pair = generate_key_pair(common_name)?;
    let params = certificate_template(common_name, false)?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| MitmError::cert_generation(common_name, e))?;

    Ok(CertificateKeyPair::new(cert.der().clone(), key_pair))
}

/// Build a certificate for `common_name` signed by `issuer`
///
/// The issuer field is the issuer certificate's subject and the signature
/// uses the issuer key's algorithm. With `is_leaf == false` the result can
/// sign further certificates; with `is_leaf == true` it is an end-entity
/// certificate whose subjectAltName covers the common name.
pub fn issue(
    common_name: &str,
    issuer: &CertificateKeyPair,
    is_leaf: bool,
) -> Result<CertificateKeyPair> {
    let key_pair = generate_key_pair(common_name)?;
    let params = certificate_template(common_name, is_leaf)?;
    let issuer_cert = issuer.as_issuer()?;

    let cert = params
        .signed_by(&key_pair, &issuer_cert, issuer.key_pair())
        .map_err(|e| MitmError::cert_generation(common_name, e))?;

    Ok(CertificateKeyPair::new(cert.der().clone(), key_pair))
}

/// Certificate template shared by roots, intermediates and leaves
fn certificate_template(common_name: &str, is_leaf: bool) -> Result<CertificateParams> {
    let mut params = if is_leaf {
        // DNS name, or IP address when the host parses as one
        CertificateParams::new(vec![common_name.to_string()])
            .map_err(|e| MitmError::cert_generation(common_name, e))?
    } else {
        CertificateParams::default()
    };

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name = distinguished_name;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    params.is_ca = if is_leaf {
        IsCa::NoCa
    } else {
        IsCa::Ca(BasicConstraints::Unconstrained)
    };

    Ok(params)
}

/// Fresh RSA 2048 key pair, signing with SHA-256
fn generate_key_pair(common_name: &str) -> Result<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).map_err(|e| MitmError::cert_generation(common_name, format!("key generation: {}", e)))
}

/// Encode DER bytes as a PEM block with 64-column lines
pub fn der_to_pem(label: &str, der: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for line in encoded.as_bytes().chunks(64) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}

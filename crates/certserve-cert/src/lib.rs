//! Certificate issuance and handshake-time resolution
//!
//! Generates a local CA and CA-signed leaves, loads static certificate files,
//! obtains certificates via ACME, and picks the right one for every TLS
//! handshake through [`CertificateResolver`].

pub mod acme;
pub mod ca;
pub mod challenge;
pub mod codec;
pub mod resolver;
pub mod self_signed;
pub mod storage;

pub use acme::{AcmeConfig, AcmeError, AcmeIssuer, ACCOUNT_CACHE_KEY};
pub use ca::{generate_ca, CertificateAuthority, IssueError, Subject};
pub use challenge::{Http01Challenge, Http01ChallengeStore};
pub use codec::CodecError;
pub use resolver::{
    AuthoritySource, CachedCertificate, CertificateIssuer, CertificateResolver, CertificateSource,
    IssuedCertificate, ResolveError, ResolverBuilder,
};
pub use self_signed::{issue_leaf, issue_leaf_at, LeafCertificate};
pub use storage::{CertCache, JsonFileCache, MemoryCache, StorageError};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use time::OffsetDateTime;

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Parse a PEM certificate chain and a PEM private key
    ///
    /// Both may come from the same buffer; blocks of the other kind are skipped.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CodecError> {
        let mut cert_reader = cert_pem;
        let cert_chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CodecError::Decode(format!("Failed to parse certificate: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(CodecError::Empty(codec::CERTIFICATE_LABEL.to_string()));
        }

        let mut key_reader = key_pem;
        let private_key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| CodecError::Decode(format!("Failed to parse private key: {}", e)))?
            .ok_or_else(|| CodecError::Empty(codec::PRIVATE_KEY_LABEL.to_string()))?;

        Ok(Self {
            cert_chain,
            private_key,
        })
    }

    /// Expiry of the end-entity certificate
    pub fn not_after(&self) -> Result<OffsetDateTime, CodecError> {
        let leaf = self
            .cert_chain
            .first()
            .ok_or_else(|| CodecError::Empty(codec::CERTIFICATE_LABEL.to_string()))?;
        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| CodecError::Decode(format!("Invalid certificate: {}", e)))?;
        Ok(cert.validity().not_after.to_datetime())
    }

    /// Signing identity for rustls
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, rustls::Error> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&self.private_key)?;
        Ok(Arc::new(CertifiedKey::new(
            self.cert_chain.clone(),
            signing_key,
        )))
    }
}

//! Leaf certificates signed by the local CA
//!
//! Every leaf gets a fresh P-256 key and a random serial. Hosts that parse as IP
//! addresses become IP SANs, everything else becomes a DNS SAN.

use rcgen::{
    CertificateParams, ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::ca::{self, CertificateAuthority, IssueError, Subject};
use crate::codec;
use crate::Certificate;

/// Leaf certificates are valid for 60 days
pub const LEAF_VALIDITY_DAYS: i64 = 60;

/// A CA-signed leaf certificate with its private key
#[derive(Debug)]
pub struct LeafCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
    /// Certificate of the signing CA, presented after the leaf
    pub ca_cert_der: CertificateDer<'static>,
    pub serial: Vec<u8>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
}

impl Clone for LeafCertificate {
    fn clone(&self) -> Self {
        Self {
            cert_der: self.cert_der.clone(),
            key_der: self.key_der.clone_key(),
            ca_cert_der: self.ca_cert_der.clone(),
            serial: self.serial.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            dns_names: self.dns_names.clone(),
            ip_addresses: self.ip_addresses.clone(),
        }
    }
}

/// Issue a leaf for `hosts`, valid from now
pub fn issue_leaf(
    ca: &CertificateAuthority,
    subject: &Subject,
    hosts: &[String],
) -> Result<LeafCertificate, IssueError> {
    issue_leaf_at(ca, subject, hosts, ca::now_utc_seconds())
}

/// Issue a leaf for `hosts` whose validity starts at `not_before`
pub fn issue_leaf_at(
    ca: &CertificateAuthority,
    subject: &Subject,
    hosts: &[String],
    not_before: OffsetDateTime,
) -> Result<LeafCertificate, IssueError> {
    subject.warn_if_incomplete("Leaf");

    let (issuer, issuer_key) = ca.signer()?;
    let (dns_names, ip_addresses) = classify_hosts(hosts);

    let mut subject_alt_names = Vec::with_capacity(hosts.len());
    for name in &dns_names {
        let name = Ia5String::try_from(name.as_str())
            .map_err(|e| IssueError::Encoding(format!("Invalid DNS name {}: {}", name, e)))?;
        subject_alt_names.push(SanType::DnsName(name));
    }
    subject_alt_names.extend(ip_addresses.iter().copied().map(SanType::IpAddress));

    let key_pair = ca::generate_key_pair()?;
    let serial = ca::random_serial()?;
    let not_after = not_before + Duration::days(LEAF_VALIDITY_DAYS);

    let mut params = CertificateParams::default();
    params.distinguished_name = subject.to_distinguished_name();
    params.subject_alt_names = subject_alt_names;
    params.serial_number = Some(serial.clone());
    params.not_before = not_before;
    params.not_after = not_after;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params
        .signed_by(&key_pair, &issuer, &issuer_key)
        .map_err(|e| IssueError::Encoding(e.to_string()))?;

    debug!(
        "Issued leaf certificate for {:?} valid until {}",
        hosts, not_after
    );

    Ok(LeafCertificate {
        cert_der: cert.der().clone(),
        key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        ca_cert_der: ca.cert_der.clone(),
        serial: serial.to_bytes(),
        not_before,
        not_after,
        dns_names,
        ip_addresses,
    })
}

/// Split hosts into DNS names and IP addresses, keeping input order in each
pub fn classify_hosts(hosts: &[String]) -> (Vec<String>, Vec<IpAddr>) {
    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();

    for host in hosts {
        match host.parse::<IpAddr>() {
            Ok(ip) => ip_addresses.push(ip),
            Err(_) => dns_names.push(host.clone()),
        }
    }

    (dns_names, ip_addresses)
}

impl LeafCertificate {
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn ip_addresses(&self) -> &[IpAddr] {
        &self.ip_addresses
    }

    pub fn cert_pem(&self) -> String {
        codec::encode_certificate(self.cert_der.as_ref())
    }

    pub fn key_pem(&self) -> String {
        codec::encode_private_key(self.key_der.secret_pkcs8_der())
    }

    /// Leaf and CA certificates as one PEM bundle, leaf first
    pub fn chain_pem(&self) -> String {
        let mut pem = self.cert_pem();
        pem.push_str(&codec::encode_certificate(self.ca_cert_der.as_ref()));
        pem
    }

    /// Save certificate and key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), IssueError> {
        ca::write_pem_pair(
            cert_path.as_ref(),
            &self.cert_pem(),
            key_path.as_ref(),
            &self.key_pem(),
        )
    }

    /// Chain `[leaf, CA]` with its key, ready for rustls
    pub fn to_certificate(&self) -> Certificate {
        Certificate::new(
            vec![self.cert_der.clone(), self.ca_cert_der.clone()],
            PrivateKeyDer::Pkcs8(self.key_der.clone_key()),
        )
    }

    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, rustls::Error> {
        self.to_certificate().certified_key()
    }
}

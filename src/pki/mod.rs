//! Certificate and key material
//!
//! Every tenant gets RSA-2048 keys stored in the kubeadm layout (PKCS#1
//! private keys, PKIX public keys). Certificates are issued with rcgen and
//! inspected with x509-parser.
//!
//! # Validity
//!
//! A certificate/key pair is usable when:
//! - both halves parse and the public keys match
//! - a leaf is signed by the current CA, a CA carries the CA constraint
//! - `not_before <= now < not_after - rotation window`
//!
//! Anything else is reported as [`Error::Certificate`] and the caller
//! regenerates the pair.

pub mod kubeconfig;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::time::Duration;
use x509_parser::certificate::X509Certificate;
use x509_parser::parse_x509_certificate;
use x509_parser::pem::Pem;

use crate::error::{Error, Result};

/// RSA modulus size for every generated key
pub const RSA_KEY_BITS: usize = 2048;

/// Validity of CA certificates (10 years)
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Validity of leaf certificates (1 year)
pub const CERT_VALIDITY_DAYS: i64 = 365;

fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Positive and never starting with a zero octet
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from_slice(&bytes)
}

fn pki_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Certificate(format!("{context}: {err}"))
}

// =============================================================================
// Key Material
// =============================================================================

/// A certificate together with the private key it was issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateKeyPair {
    /// PEM-encoded certificate
    pub certificate: String,
    /// PEM-encoded private key
    pub private_key: String,
}

/// A bare key pair, used for service-account token signing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyPair {
    pub public_key: String,
    pub private_key: String,
}

/// Subject and alternative names of a leaf certificate
#[derive(Debug, Clone, Default)]
pub struct CertificateRequest {
    pub common_name: String,
    pub organization: Option<String>,
    /// DNS names and IP addresses, told apart when the certificate is built
    pub sans: Vec<String>,
}

impl CertificateRequest {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn sans<I, S>(mut self, sans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sans.extend(sans.into_iter().map(Into::into));
        self
    }
}

fn generate_rsa_key() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS).map_err(|e| pki_error("generating RSA key", e))
}

/// Parse a private key in PKCS#1 or PKCS#8 PEM form
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| pki_error("parsing private key", e))
}

fn encode_private_key(key: &RsaPrivateKey) -> Result<String> {
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| pki_error("encoding private key", e))?;
    Ok(pem.to_string())
}

/// rcgen signs with ring, which only loads PKCS#8 documents
fn signing_key(key: &RsaPrivateKey) -> Result<KeyPair> {
    let pkcs8 = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| pki_error("encoding private key", e))?;
    KeyPair::from_pem_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256).map_err(|e| pki_error("loading signing key", e))
}

fn subject(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    if let Some(organization) = organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(organization.to_string()));
    }
    dn
}

fn subject_alt_names(sans: &[String]) -> Result<Vec<SanType>> {
    let mut names: Vec<SanType> = Vec::with_capacity(sans.len());
    for san in sans {
        let name = match san.parse::<std::net::IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => Ia5String::try_from(san.to_string())
                .map(SanType::DnsName)
                .map_err(|e| pki_error(&format!("invalid DNS name '{san}'"), e))?,
        };
        if !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

// =============================================================================
// Generation
// =============================================================================

/// Generate a self-signed certificate authority
pub fn generate_ca(common_name: &str) -> Result<CertificateKeyPair> {
    let key = generate_rsa_key()?;
    let key_pair = signing_key(&key)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject(common_name, None);
    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    let (not_before, not_after) = compute_validity(CA_VALIDITY_DAYS);
    params.not_before = not_before;
    params.not_after = not_after;

    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| pki_error("self-signing CA", e))?;

    Ok(CertificateKeyPair {
        certificate: certificate.pem(),
        private_key: encode_private_key(&key)?,
    })
}

/// Issue a leaf certificate signed by `ca`
pub fn generate_certificate(ca: &CertificateKeyPair, request: &CertificateRequest) -> Result<CertificateKeyPair> {
    let ca_key = signing_key(&parse_private_key(&ca.private_key)?)?;
    let issuer =
        Issuer::from_ca_cert_pem(&ca.certificate, &ca_key).map_err(|e| pki_error("loading issuer", e))?;

    let key = generate_rsa_key()?;
    let key_pair = signing_key(&key)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject(&request.common_name, request.organization.as_deref());
    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::CodeSigning,
    ];
    params.use_authority_key_identifier_extension = true;
    params.subject_alt_names = subject_alt_names(&request.sans)?;
    let (not_before, not_after) = compute_validity(CERT_VALIDITY_DAYS);
    params.not_before = not_before;
    params.not_after = not_after;

    let certificate = params
        .signed_by(&key_pair, &issuer)
        .map_err(|e| pki_error(&format!("signing {}", request.common_name), e))?;

    Ok(CertificateKeyPair {
        certificate: certificate.pem(),
        private_key: encode_private_key(&key)?,
    })
}

/// Generate the service-account signing key pair
pub fn generate_public_key_pair() -> Result<PublicKeyPair> {
    let key = generate_rsa_key()?;
    let public_key = RsaPublicKey::from(&key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| pki_error("encoding public key", e))?;
    Ok(PublicKeyPair {
        public_key,
        private_key: encode_private_key(&key)?,
    })
}

// =============================================================================
// Inspection
// =============================================================================

/// What the watcher and the resources need to know about a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Colon-separated hex serial
    pub serial: String,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    fn from_certificate(cert: &X509Certificate<'_>) -> Result<Self> {
        Ok(Self {
            serial: cert.raw_serial_as_string(),
            subject: cert.subject().to_string(),
            not_before: timestamp(cert.validity().not_before.timestamp())?,
            not_after: timestamp(cert.validity().not_after.timestamp())?,
        })
    }

    /// Instant from which the certificate must be rotated
    pub fn rotation_deadline(&self, window: Duration) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        self.not_after - window
    }

    /// Usable now and not yet inside the rotation window
    pub fn is_current(&self, window: Duration) -> bool {
        let now = Utc::now();
        self.not_before <= now && now < self.rotation_deadline(window)
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| Error::Certificate(format!("timestamp {secs} out of range")))
}

/// DER bodies of every CERTIFICATE block in a PEM bundle
fn certificate_blocks(pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut blocks = Vec::new();
    for block in Pem::iter_from_buffer(pem) {
        let block = block.map_err(|e| pki_error("decoding PEM", e))?;
        if block.label == "CERTIFICATE" {
            blocks.push(block.contents);
        }
    }
    if blocks.is_empty() {
        return Err(Error::Certificate("no certificate found in PEM data".into()));
    }
    Ok(blocks)
}

fn parse<'a>(der: &'a [u8]) -> Result<X509Certificate<'a>> {
    let (_, cert) = parse_x509_certificate(der).map_err(|e| pki_error("parsing certificate", e))?;
    Ok(cert)
}

/// Describe the first certificate of a PEM bundle
pub fn certificate_info(pem: &[u8]) -> Result<CertificateInfo> {
    let blocks = certificate_blocks(pem)?;
    CertificateInfo::from_certificate(&parse(&blocks[0])?)
}

/// Earliest `not_after` across every certificate of a PEM bundle
pub fn earliest_expiry(pem: &[u8]) -> Result<DateTime<Utc>> {
    let mut earliest: Option<DateTime<Utc>> = None;
    for der in certificate_blocks(pem)? {
        let not_after = CertificateInfo::from_certificate(&parse(&der)?)?.not_after;
        earliest = Some(earliest.map_or(not_after, |current| current.min(not_after)));
    }
    earliest.ok_or_else(|| Error::Certificate("no certificate found in PEM data".into()))
}

// =============================================================================
// Verification
// =============================================================================

fn check_key_matches(cert: &X509Certificate<'_>, private_key: &str) -> Result<()> {
    let key = parse_private_key(private_key)?;
    let cert_key =
        RsaPublicKey::from_public_key_der(cert.public_key().raw).map_err(|e| pki_error("reading certificate key", e))?;
    if cert_key != key.to_public_key() {
        return Err(Error::Certificate("certificate does not match private key".into()));
    }
    Ok(())
}

fn check_window(cert: &X509Certificate<'_>, window: Duration) -> Result<()> {
    let info = CertificateInfo::from_certificate(cert)?;
    if !info.is_current(window) {
        return Err(Error::Certificate(format!(
            "certificate {} is outside its usable window (not after {})",
            info.subject, info.not_after
        )));
    }
    Ok(())
}

/// Check a CA pair
pub fn verify_ca(ca: &CertificateKeyPair, window: Duration) -> Result<()> {
    let blocks = certificate_blocks(ca.certificate.as_bytes())?;
    let cert = parse(&blocks[0])?;
    if !cert.is_ca() {
        return Err(Error::Certificate("certificate is not a CA".into()));
    }
    check_key_matches(&cert, &ca.private_key)?;
    check_window(&cert, window)
}

/// Check a leaf pair against the CA certificate that must have signed it
pub fn verify_certificate(pair: &CertificateKeyPair, ca_certificate: &str, window: Duration) -> Result<()> {
    let blocks = certificate_blocks(pair.certificate.as_bytes())?;
    let cert = parse(&blocks[0])?;
    check_key_matches(&cert, &pair.private_key)?;

    let ca_blocks = certificate_blocks(ca_certificate.as_bytes())?;
    let ca = parse(&ca_blocks[0])?;
    cert.verify_signature(Some(ca.public_key()))
        .map_err(|e| pki_error("verifying issuer signature", e))?;

    check_window(&cert, window)
}

/// Check that a public key belongs to a private key
pub fn verify_public_key_pair(pair: &PublicKeyPair) -> Result<()> {
    let public_key =
        RsaPublicKey::from_public_key_pem(&pair.public_key).map_err(|e| pki_error("parsing public key", e))?;
    if public_key != parse_private_key(&pair.private_key)?.to_public_key() {
        return Err(Error::Certificate("public key does not match private key".into()));
    }
    Ok(())
}

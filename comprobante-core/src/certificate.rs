//! Signing credentials from PKCS#12 bundles.
//!
//! [`CertificateCredential::load`] is the gate used before signing: it fails for a wrong
//! password, a damaged bundle, an unusable key or a certificate outside its validity window.
//! [`CertificateCredential::inspect`] and [`CertificateCredential::status`] only report; a
//! certificate that is about to expire (or already has) is described, never rejected.
//!
//! Supported keys are RSA (PKCS#1 v1.5 with SHA-256) and secp256k1 ECDSA (SHA-256).
use std::fmt::{self, Write};

use chrono::{DateTime, Utc};
use k256::ecdsa::{
    Signature as K256Signature, SigningKey as K256SigningKey, VerifyingKey as K256VerifyingKey,
};
use k256::pkcs8::DecodePrivateKey as _;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15;
use rsa::pkcs8::{DecodePrivateKey, PrivateKeyInfo};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signature::{SignatureEncoding, Signer, Verifier};
use thiserror::Error;
use tracing::{debug, warn};
use x509_cert::der::Decode;
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509_cert::spki::{ObjectIdentifier, SubjectPublicKeyInfoOwned};
use x509_cert::Certificate;

use crate::config::Config;
use crate::document::xml::constants::{ECDSA_SHA256, RSA_SHA256};

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256K1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.10");

/// Errors emitted while loading or using a credential. Never carries key material.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("wrong PKCS#12 password")]
    BadPassword,
    #[error("corrupt PKCS#12 bundle: {reason}")]
    Corrupt { reason: String },
    /// The bundle uses a MAC or encryption scheme other than the legacy SHA-1 PBE family.
    #[error("unsupported PKCS#12 format: {reason}")]
    UnsupportedFormat { reason: String },
    #[error("certificate '{subject}' expired on {not_after}")]
    Expired {
        subject: String,
        not_after: DateTime<Utc>,
    },
    #[error("certificate '{subject}' is not valid before {not_before}")]
    NotYetValid {
        subject: String,
        not_before: DateTime<Utc>,
    },
    #[error("private key does not belong to any certificate in the bundle")]
    KeyMismatch,
    #[error("unsupported key algorithm: {algorithm}")]
    UnsupportedKey { algorithm: String },
    #[error("RSA key of {bits} bits is below the {min_bits}-bit minimum")]
    WeakKey { bits: usize, min_bits: usize },
    #[error("certificate '{subject}' cannot be used for signing: {reason}")]
    NotForSigning { subject: String, reason: &'static str },
    #[error("signing operation failed")]
    Signing(#[source] signature::Error),
}

fn corrupt(reason: impl Into<String>) -> CertificateError {
    CertificateError::Corrupt {
        reason: reason.into(),
    }
}

fn is_legacy_pbe(algorithm: &p12::AlgorithmIdentifier) -> bool {
    matches!(
        algorithm,
        p12::AlgorithmIdentifier::PbeWithSHAAnd3KeyTripleDESCBC(_)
            | p12::AlgorithmIdentifier::PbewithSHAAnd40BitRC2CBC(_)
    )
}

fn unsupported_format(what: &str, algorithm: &p12::AlgorithmIdentifier) -> CertificateError {
    let oid = match algorithm {
        p12::AlgorithmIdentifier::Sha1 => "1.3.14.3.2.26".to_owned(),
        p12::AlgorithmIdentifier::PbewithSHAAnd40BitRC2CBC(_) => "1.2.840.113549.1.12.1.6".to_owned(),
        p12::AlgorithmIdentifier::PbeWithSHAAnd3KeyTripleDESCBC(_) => {
            "1.2.840.113549.1.12.1.3".to_owned()
        }
        p12::AlgorithmIdentifier::OtherAlg(other) => other
            .algorithm_type
            .components()
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join("."),
    };
    CertificateError::UnsupportedFormat {
        reason: format!("{what} algorithm {oid}"),
    }
}

/// Signature algorithm implied by the credential's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    RsaSha256,
    EcdsaSha256,
}

impl SignatureAlgorithm {
    /// XML-DSig `SignatureMethod` algorithm URI.
    pub fn uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha256 => RSA_SHA256,
            SignatureAlgorithm::EcdsaSha256 => ECDSA_SHA256,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            RSA_SHA256 => Some(SignatureAlgorithm::RsaSha256),
            ECDSA_SHA256 => Some(SignatureAlgorithm::EcdsaSha256),
            _ => None,
        }
    }
}

enum PrivateKey {
    Rsa(RsaPrivateKey),
    K256(K256SigningKey),
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl PrivateKey {
    fn from_pkcs8_der(der: &[u8]) -> Result<Self, CertificateError> {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::Rsa(key));
        }
        if let Ok(key) = K256SigningKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::K256(key));
        }
        let info = PrivateKeyInfo::try_from(der)
            .map_err(|_| corrupt("private key is not a PKCS#8 structure"))?;
        let algorithm = match info.algorithm.parameters_oid() {
            Ok(curve) => format!("{} ({curve})", info.algorithm.oid),
            Err(_) => info.algorithm.oid.to_string(),
        };
        Err(CertificateError::UnsupportedKey { algorithm })
    }

    fn public_key(&self) -> PublicKey {
        match self {
            PrivateKey::Rsa(key) => PublicKey::Rsa(RsaPublicKey::from(key)),
            PrivateKey::K256(key) => PublicKey::K256(key.verifying_key().clone()),
        }
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CertificateError> {
        match self {
            PrivateKey::Rsa(key) => {
                let signer = pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                let signature = signer.try_sign(message).map_err(CertificateError::Signing)?;
                Ok(signature.to_vec())
            }
            PrivateKey::K256(key) => {
                let signature: K256Signature =
                    key.try_sign(message).map_err(CertificateError::Signing)?;
                Ok(signature.to_bytes().to_vec())
            }
        }
    }
}

/// Public key of a certificate, as needed to check a `SignatureValue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PublicKey {
    Rsa(RsaPublicKey),
    K256(K256VerifyingKey),
}

impl PublicKey {
    pub(crate) fn from_certificate(cert: &Certificate) -> Result<Self, CertificateError> {
        Self::from_spki(&cert.tbs_certificate.subject_public_key_info)
    }

    fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self, CertificateError> {
        let raw = spki.subject_public_key.raw_bytes();
        if spki.algorithm.oid == RSA_ENCRYPTION {
            return RsaPublicKey::from_pkcs1_der(raw)
                .map(PublicKey::Rsa)
                .map_err(|_| corrupt("certificate RSA key is malformed"));
        }
        if spki.algorithm.oid == EC_PUBLIC_KEY {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.decode_as::<ObjectIdentifier>().ok());
            if curve != Some(SECP256K1) {
                return Err(CertificateError::UnsupportedKey {
                    algorithm: match curve {
                        Some(oid) => format!("{EC_PUBLIC_KEY} ({oid})"),
                        None => EC_PUBLIC_KEY.to_string(),
                    },
                });
            }
            return K256VerifyingKey::from_sec1_bytes(raw)
                .map(PublicKey::K256)
                .map_err(|_| corrupt("certificate EC key is malformed"));
        }
        Err(CertificateError::UnsupportedKey {
            algorithm: spki.algorithm.oid.to_string(),
        })
    }

    pub(crate) fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            PublicKey::Rsa(_) => SignatureAlgorithm::RsaSha256,
            PublicKey::K256(_) => SignatureAlgorithm::EcdsaSha256,
        }
    }

    /// ECDSA signatures are the raw 64-byte `r || s` form.
    pub(crate) fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self {
            PublicKey::Rsa(key) => {
                let verifier = pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                pkcs1v15::Signature::try_from(signature)
                    .map(|sig| verifier.verify(message, &sig).is_ok())
                    .unwrap_or(false)
            }
            PublicKey::K256(key) => K256Signature::from_slice(signature)
                .map(|sig| key.verify(message, &sig).is_ok())
                .unwrap_or(false),
        }
    }
}

/// Expiry classification for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationWarning {
    None,
    Info,
    Warning,
    Critical,
    Expired,
}

impl ExpirationWarning {
    /// `thresholds` are the info, warning and critical limits in days.
    pub fn classify(not_after: DateTime<Utc>, now: DateTime<Utc>, thresholds: [u32; 3]) -> Self {
        if now > not_after {
            return ExpirationWarning::Expired;
        }
        let days = (not_after - now).num_days();
        let [info, warning, critical] = thresholds.map(i64::from);
        if days <= critical {
            ExpirationWarning::Critical
        } else if days <= warning {
            ExpirationWarning::Warning
        } else if days <= info {
            ExpirationWarning::Info
        } else {
            ExpirationWarning::None
        }
    }
}

/// Read-only certificate report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub has_certificate: bool,
    pub valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_to_expiry: Option<i64>,
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub serial_number: Option<String>,
    pub fingerprint_sha256: Option<String>,
    pub warning: ExpirationWarning,
}

impl CertificateStatus {
    /// Status for a tenant without a certificate.
    pub fn absent() -> Self {
        Self {
            has_certificate: false,
            valid: false,
            expires_at: None,
            days_to_expiry: None,
            issuer: None,
            subject: None,
            serial_number: None,
            fingerprint_sha256: None,
            warning: ExpirationWarning::None,
        }
    }
}

/// Private key, leaf certificate and chain from a PKCS#12 bundle.
///
/// Immutable once built; share it between signing threads behind an `Arc`. `Debug` never
/// prints the key and equality compares leaf certificates only.
pub struct CertificateCredential {
    key: PrivateKey,
    leaf: Certificate,
    leaf_der: Vec<u8>,
    chain_der: Vec<Vec<u8>>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    subject: String,
    issuer: String,
    serial_number: String,
}

impl fmt::Debug for CertificateCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateCredential")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial_number", &self.serial_number)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("chain_len", &self.chain_der.len())
            .field("key", &self.key)
            .finish()
    }
}

impl PartialEq for CertificateCredential {
    fn eq(&self, other: &Self) -> bool {
        self.leaf_der == other.leaf_der
    }
}

impl Eq for CertificateCredential {}

impl CertificateCredential {
    /// Loads a bundle for signing, using the current time and default limits.
    pub fn load(p12: &[u8], password: &str) -> Result<Self, CertificateError> {
        Self::load_with(p12, password, &Config::default(), Utc::now())
    }

    pub fn load_at(p12: &[u8], password: &str, now: DateTime<Utc>) -> Result<Self, CertificateError> {
        Self::load_with(p12, password, &Config::default(), now)
    }

    pub fn load_with(
        p12: &[u8],
        password: &str,
        config: &Config,
        now: DateTime<Utc>,
    ) -> Result<Self, CertificateError> {
        let credential = Self::open(p12, password, config)?;
        credential.check_valid_at(now)?;
        let warning = ExpirationWarning::classify(
            credential.not_after,
            now,
            config.expiry_warning_days(),
        );
        if warning != ExpirationWarning::None {
            warn!(
                subject = %credential.subject,
                days_to_expiry = (credential.not_after - now).num_days(),
                ?warning,
                "signing certificate close to expiry"
            );
        }
        debug!(subject = %credential.subject, serial = %credential.serial_number, "credential loaded");
        Ok(credential)
    }

    /// Reports on a bundle without the validity-window gate.
    pub fn inspect(p12: &[u8], password: &str) -> Result<CertificateStatus, CertificateError> {
        let config = Config::default();
        Ok(Self::open(p12, password, &config)?.status_with(&config, Utc::now()))
    }

    /// Builds a credential from a DER certificate and a PKCS#8 DER key. No validity-window gate.
    pub fn from_der(cert_der: &[u8], private_key_der: &[u8]) -> Result<Self, CertificateError> {
        Self::from_parts(private_key_der, vec![cert_der.to_vec()], &Config::default())
    }

    /// PEM variant of [`from_der`](Self::from_der); the key must be a `PRIVATE KEY` (PKCS#8) block.
    pub fn from_pem(cert_pem: &str, private_key_pem: &str) -> Result<Self, CertificateError> {
        let (_, cert_der) = x509_cert::der::pem::decode_vec(cert_pem.as_bytes())
            .map_err(|_| corrupt("certificate is not valid PEM"))?;
        let (label, key_der) = x509_cert::der::pem::decode_vec(private_key_pem.as_bytes())
            .map_err(|_| corrupt("private key is not valid PEM"))?;
        if label != "PRIVATE KEY" {
            return Err(corrupt(format!("expected a PRIVATE KEY block, found {label}")));
        }
        Self::from_der(&cert_der, &key_der)
    }

    fn open(p12: &[u8], password: &str, config: &Config) -> Result<Self, CertificateError> {
        let pfx = p12::PFX::parse(p12).map_err(|_| corrupt("not a PKCS#12 structure"))?;
        if let Some(mac_data) = &pfx.mac_data {
            if mac_data.mac.digest_algorithm != p12::AlgorithmIdentifier::Sha1 {
                return Err(unsupported_format("MAC digest", &mac_data.mac.digest_algorithm));
            }
        }
        if !pfx.verify_mac(password) {
            return Err(CertificateError::BadPassword);
        }
        // With the MAC verified, content that does not decrypt is in a scheme we cannot read.
        let bags = pfx.bags(password).map_err(|_| match pfx.mac_data {
            Some(_) => CertificateError::UnsupportedFormat {
                reason: "content encryption scheme (re-export the bundle with legacy 3DES encryption)"
                    .to_owned(),
            },
            None => corrupt("content cannot be decrypted"),
        })?;
        for bag in &bags {
            if let p12::SafeBagKind::Pkcs8ShroudedKeyBag(info) = &bag.bag {
                if !is_legacy_pbe(&info.encryption_algorithm) {
                    return Err(unsupported_format("key encryption", &info.encryption_algorithm));
                }
            }
        }
        let keys = pfx
            .key_bags(password)
            .map_err(|_| corrupt("private key bag cannot be decrypted"))?;
        let certs = pfx
            .cert_x509_bags(password)
            .map_err(|_| corrupt("certificate bag cannot be decrypted"))?;
        let key_der = match keys.as_slice() {
            [] => return Err(corrupt("bundle contains no private key")),
            [key] => key,
            _ => return Err(corrupt("bundle contains more than one private key")),
        };
        Self::from_parts(key_der, certs, config)
    }

    fn from_parts(
        key_der: &[u8],
        cert_ders: Vec<Vec<u8>>,
        config: &Config,
    ) -> Result<Self, CertificateError> {
        if cert_ders.is_empty() {
            return Err(corrupt("bundle contains no certificate"));
        }
        let key = PrivateKey::from_pkcs8_der(key_der)?;
        if let PrivateKey::Rsa(rsa_key) = &key {
            let bits = rsa_key.size() * 8;
            if bits < config.min_rsa_bits() {
                return Err(CertificateError::WeakKey {
                    bits,
                    min_bits: config.min_rsa_bits(),
                });
            }
        }
        let public = key.public_key();

        let mut leaf = None;
        let mut chain_der = Vec::new();
        for der in cert_ders {
            let cert = Certificate::from_der(&der)
                .map_err(|_| corrupt("certificate is not valid DER"))?;
            let matches = leaf.is_none()
                && PublicKey::from_certificate(&cert).is_ok_and(|pk| pk == public);
            if matches {
                leaf = Some((cert, der));
            } else {
                chain_der.push(der);
            }
        }
        let (leaf, leaf_der) = leaf.ok_or(CertificateError::KeyMismatch)?;

        let tbs = &leaf.tbs_certificate;
        let subject = tbs.subject.to_string();
        check_key_usage(&leaf, &subject)?;

        let (not_before, not_after) = validity_window(&leaf)?;
        let issuer = tbs.issuer.to_string();
        let serial_number = serial_bytes_to_decimal_string(tbs.serial_number.as_bytes());

        Ok(Self {
            key,
            leaf,
            leaf_der,
            chain_der,
            not_before,
            not_after,
            subject,
            issuer,
            serial_number,
        })
    }

    /// Fails unless `now` is inside the certificate's validity window.
    pub fn check_valid_at(&self, now: DateTime<Utc>) -> Result<(), CertificateError> {
        if now > self.not_after {
            return Err(CertificateError::Expired {
                subject: self.subject.clone(),
                not_after: self.not_after,
            });
        }
        if now < self.not_before {
            return Err(CertificateError::NotYetValid {
                subject: self.subject.clone(),
                not_before: self.not_before,
            });
        }
        Ok(())
    }

    pub fn status(&self) -> CertificateStatus {
        self.status_with(&Config::default(), Utc::now())
    }

    pub fn status_with(&self, config: &Config, now: DateTime<Utc>) -> CertificateStatus {
        CertificateStatus {
            has_certificate: true,
            valid: self.check_valid_at(now).is_ok(),
            expires_at: Some(self.not_after),
            days_to_expiry: Some((self.not_after - now).num_days()),
            issuer: Some(self.issuer.clone()),
            subject: Some(self.subject.clone()),
            serial_number: Some(self.serial_number.clone()),
            fingerprint_sha256: Some(self.fingerprint_sha256()),
            warning: ExpirationWarning::classify(self.not_after, now, config.expiry_warning_days()),
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self.key {
            PrivateKey::Rsa(_) => SignatureAlgorithm::RsaSha256,
            PrivateKey::K256(_) => SignatureAlgorithm::EcdsaSha256,
        }
    }

    pub fn certificate(&self) -> &Certificate {
        &self.leaf
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.leaf_der
    }

    /// Other certificates of the bundle, in bundle order.
    pub fn chain_der(&self) -> &[Vec<u8>] {
        &self.chain_der
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Decimal serial number.
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn fingerprint_sha256(&self) -> String {
        let digest = Sha256::digest(&self.leaf_der);
        let mut hex = String::with_capacity(64);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CertificateError> {
        self.key.sign(message)
    }
}

fn check_key_usage(cert: &Certificate, subject: &str) -> Result<(), CertificateError> {
    let not_for_signing = |reason| CertificateError::NotForSigning {
        subject: subject.to_owned(),
        reason,
    };
    let key_usage = cert
        .tbs_certificate
        .get::<KeyUsage>()
        .map_err(|_| corrupt("KeyUsage extension is malformed"))?;
    if let Some((_, usage)) = key_usage {
        if !usage.0.contains(KeyUsages::DigitalSignature) {
            return Err(not_for_signing("KeyUsage lacks digitalSignature"));
        }
    }
    let constraints = cert
        .tbs_certificate
        .get::<BasicConstraints>()
        .map_err(|_| corrupt("BasicConstraints extension is malformed"))?;
    if let Some((_, constraints)) = constraints {
        if constraints.ca {
            return Err(not_for_signing("certificate is a CA certificate"));
        }
    }
    Ok(())
}

pub(crate) fn validity_window(
    cert: &Certificate,
) -> Result<(DateTime<Utc>, DateTime<Utc>), CertificateError> {
    let validity = &cert.tbs_certificate.validity;
    Ok((
        to_utc(validity.not_before.to_unix_duration())?,
        to_utc(validity.not_after.to_unix_duration())?,
    ))
}

fn to_utc(since_epoch: std::time::Duration) -> Result<DateTime<Utc>, CertificateError> {
    i64::try_from(since_epoch.as_secs())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| corrupt("certificate validity is out of range"))
}

/// Big-endian unsigned bytes to decimal text.
pub(crate) fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}

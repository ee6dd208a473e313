use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use comprobante_core::certificate::CertificateCredential;
use comprobante_core::document::xml::{parse_document, Document};
use k256::ecdsa::SigningKey;
use k256::pkcs8::EncodePrivateKey;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::UtcTime;
use x509_cert::der::Encode;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{EncodePublicKey, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};

pub const P12_PASSWORD: &str = "1234";
pub const FACTURA: &str = include_str!("../fixtures/documents/factura-electronica.xml");
#[allow(dead_code)]
pub const NOTA_CREDITO_PREFIXED: &str =
    include_str!("../fixtures/documents/nota-credito-prefixed.xml");
#[allow(dead_code)]
pub const RSA_P12: &[u8] = include_bytes!("../fixtures/certs/emisor-rsa.p12");

#[allow(dead_code)]
pub fn factura() -> Document {
    parse_document(FACTURA).expect("factura fixture")
}

/// RSA-2048 credential from the OpenSSL-made bundle.
#[allow(dead_code)]
pub fn rsa_credential() -> CertificateCredential {
    CertificateCredential::load(RSA_P12, P12_PASSWORD).expect("rsa fixture")
}

/// Throwaway secp256k1 key, certificate and PKCS#12 bundle.
#[allow(dead_code)]
pub struct TestIdentity {
    pub key: SigningKey,
    pub cert_der: Vec<u8>,
    pub p12: Vec<u8>,
}

#[allow(dead_code)]
impl TestIdentity {
    /// Valid from an hour ago for `lifetime`.
    pub fn valid_for(lifetime: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch");
        let start = now - Duration::from_secs(3600);
        Self::with_window(start, start + lifetime + Duration::from_secs(3600))
    }

    /// Validity window as offsets from the Unix epoch.
    pub fn with_window(not_before: Duration, not_after: Duration) -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let validity = Validity {
            not_before: Time::UtcTime(UtcTime::from_unix_duration(not_before).expect("not_before")),
            not_after: Time::UtcTime(UtcTime::from_unix_duration(not_after).expect("not_after")),
        };
        let cert_der = build_test_cert(&key, validity);
        let key_der = key.to_pkcs8_der().expect("key der");
        let p12 = p12::PFX::new(&cert_der, key_der.as_bytes(), None, P12_PASSWORD, "emisor")
            .expect("pfx")
            .to_der();
        Self { key, cert_der, p12 }
    }

    pub fn credential(&self) -> CertificateCredential {
        let key_der = self.key.to_pkcs8_der().expect("key der");
        CertificateCredential::from_der(&self.cert_der, key_der.as_bytes()).expect("credential")
    }
}

fn build_test_cert(key: &SigningKey, validity: Validity) -> Vec<u8> {
    let serial_number = SerialNumber::from(4_242u32);
    let subject =
        Name::from_str("CN=PRUEBA K256,OU=CPF-01-2345-6789,O=Persona Fisica de Prueba,C=CR")
            .expect("subject");
    let profile = Profile::Leaf {
        issuer: subject.clone(),
        enable_key_agreement: false,
        enable_key_encipherment: false,
    };
    let spki_der = key.verifying_key().to_public_key_der().expect("public key der");
    let pub_key = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).expect("spki");
    let builder = CertificateBuilder::new(profile, serial_number, validity, subject, pub_key, key)
        .expect("builder");
    let cert = builder
        .build::<k256::ecdsa::DerSignature>()
        .expect("certificate");
    cert.to_der().expect("cert der")
}

/// Seconds since the epoch for a calendar instant, for validity windows.
#[allow(dead_code)]
pub fn epoch(rfc3339: &str) -> Duration {
    let time = chrono::DateTime::parse_from_rfc3339(rfc3339).expect("timestamp");
    Duration::from_secs(time.timestamp() as u64)
}

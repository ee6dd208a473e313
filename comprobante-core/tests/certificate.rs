mod common;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use comprobante_core::certificate::{
    CertificateCredential, CertificateError, ExpirationWarning, SignatureAlgorithm,
};
use comprobante_core::config::Config;
use common::{epoch, TestIdentity, P12_PASSWORD, RSA_P12};

#[test]
fn loads_rsa_bundle() {
    let credential = CertificateCredential::load(RSA_P12, P12_PASSWORD).expect("load");
    assert_eq!(credential.algorithm(), SignatureAlgorithm::RsaSha256);
    assert!(credential.subject().contains("CN=PRUEBA EMISOR"));
    assert!(credential.chain_der().is_empty());
    assert_eq!(credential.fingerprint_sha256().len(), 64);
}

#[test]
fn loads_generated_k256_bundle() {
    let identity = TestIdentity::valid_for(Duration::from_secs(86_400 * 90));
    let credential = CertificateCredential::load(&identity.p12, P12_PASSWORD).expect("load");
    assert_eq!(credential.algorithm(), SignatureAlgorithm::EcdsaSha256);
    assert_eq!(credential.certificate_der(), identity.cert_der.as_slice());
    assert_eq!(credential.serial_number(), "4242");
    assert_eq!(credential, identity.credential());
}

#[test]
fn wrong_password_is_bad_password() {
    let err = CertificateCredential::load(RSA_P12, "4321").unwrap_err();
    assert!(matches!(err, CertificateError::BadPassword));

    let identity = TestIdentity::valid_for(Duration::from_secs(86_400));
    let err = CertificateCredential::load(&identity.p12, "wrong").unwrap_err();
    assert!(matches!(err, CertificateError::BadPassword));
}

#[test]
fn garbage_is_corrupt() {
    let err = CertificateCredential::load(b"not a bundle", P12_PASSWORD).unwrap_err();
    assert!(matches!(err, CertificateError::Corrupt { .. }));

    let truncated = &RSA_P12[..RSA_P12.len() / 2];
    let err = CertificateCredential::load(truncated, P12_PASSWORD).unwrap_err();
    assert!(matches!(err, CertificateError::Corrupt { .. }));
}

#[test]
fn openssl3_default_bundle_is_an_unsupported_format() {
    let bundle = include_bytes!("fixtures/certs/emisor-rsa-aes.p12");
    for password in [P12_PASSWORD, "4321"] {
        match CertificateCredential::load(bundle, password).unwrap_err() {
            CertificateError::UnsupportedFormat { reason } => {
                assert!(reason.contains("MAC digest"), "{reason}");
                assert!(reason.contains("2.16.840.1.101.3.4.2.1"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
    assert!(matches!(
        CertificateCredential::inspect(bundle, P12_PASSWORD),
        Err(CertificateError::UnsupportedFormat { .. })
    ));
}

#[test]
fn aes_encrypted_content_is_an_unsupported_format() {
    let sha1_mac = include_bytes!("fixtures/certs/emisor-rsa-aes-sha1mac.p12");
    let err = CertificateCredential::load(sha1_mac, P12_PASSWORD).unwrap_err();
    assert!(matches!(err, CertificateError::UnsupportedFormat { .. }), "{err:?}");
    let err = CertificateCredential::load(sha1_mac, "4321").unwrap_err();
    assert!(matches!(err, CertificateError::BadPassword), "{err:?}");

    let aes_key = include_bytes!("fixtures/certs/emisor-rsa-aes-key.p12");
    match CertificateCredential::load(aes_key, P12_PASSWORD).unwrap_err() {
        CertificateError::UnsupportedFormat { reason } => {
            assert!(reason.contains("key encryption"), "{reason}");
            assert!(reason.contains("1.2.840.113549.1.5.13"), "{reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn expired_bundle_fails_to_load_but_can_be_inspected() {
    let identity = TestIdentity::with_window(
        epoch("2020-01-01T00:00:00Z"),
        epoch("2021-01-01T00:00:00Z"),
    );
    let err = CertificateCredential::load(&identity.p12, P12_PASSWORD).unwrap_err();
    match &err {
        CertificateError::Expired { not_after, .. } => {
            assert_eq!(*not_after, Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!err.to_string().contains("PRIVATE"));

    let status = CertificateCredential::inspect(&identity.p12, P12_PASSWORD).expect("inspect");
    assert!(status.has_certificate);
    assert!(!status.valid);
    assert_eq!(status.warning, ExpirationWarning::Expired);
    assert!(status.days_to_expiry.is_some_and(|days| days < 0));
}

#[test]
fn future_bundle_is_not_yet_valid() {
    let identity = TestIdentity::with_window(
        epoch("2040-01-01T00:00:00Z"),
        epoch("2041-01-01T00:00:00Z"),
    );
    let err = CertificateCredential::load(&identity.p12, P12_PASSWORD).unwrap_err();
    assert!(matches!(err, CertificateError::NotYetValid { .. }));
}

#[test]
fn load_at_uses_supplied_clock() {
    let identity = TestIdentity::with_window(
        epoch("2030-01-01T00:00:00Z"),
        epoch("2031-01-01T00:00:00Z"),
    );
    let inside = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();
    let credential =
        CertificateCredential::load_at(&identity.p12, P12_PASSWORD, inside).expect("load_at");

    let status = credential.status_with(&Config::default(), inside);
    assert!(status.valid);
    assert_eq!(status.days_to_expiry, Some(214));
    assert_eq!(status.warning, ExpirationWarning::None);

    let near_end = Utc.with_ymd_and_hms(2030, 12, 20, 0, 0, 0).unwrap();
    let status = credential.status_with(&Config::default(), near_end);
    assert_eq!(status.warning, ExpirationWarning::Warning);
}

#[test]
fn status_serializes_for_dashboards() {
    let credential = CertificateCredential::load(RSA_P12, P12_PASSWORD).expect("load");
    let json = serde_json::to_value(credential.status()).expect("json");
    assert_eq!(json["has_certificate"], true);
    assert_eq!(json["valid"], true);
    assert!(json["subject"].as_str().is_some());
    assert!(json["expires_at"].as_str().is_some());
}

#[test]
fn debug_never_shows_key_material() {
    let identity = TestIdentity::valid_for(Duration::from_secs(86_400));
    let rendered = format!("{:?}", identity.credential());
    assert!(rendered.contains("<redacted>"));
    let secret = format!("{:?}", identity.key.to_bytes());
    assert!(!rendered.contains(&secret));
}

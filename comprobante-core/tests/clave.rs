use chrono::NaiveDate;
use comprobante_core::clave::{
    DocumentKey, IdentificationType, IssuerIdentification, KeyError, SecurityCode, Situation,
};
use comprobante_core::consecutive::ConsecutiveNumber;
use proptest::prelude::*;

fn consecutive() -> ConsecutiveNumber {
    "00100001010000000001".parse().expect("consecutive")
}

#[test]
fn synthetic_key_has_documented_layout() {
    let issuer = IssuerIdentification::new(IdentificationType::Fisica, "123456789").unwrap();
    let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    let key = DocumentKey::assemble(
        &issuer,
        date,
        &consecutive(),
        Situation::Normal,
        &SecurityCode::new("12345678").unwrap(),
    )
    .unwrap();

    assert_eq!(key.as_str().len(), 50);
    assert_eq!(key.country(), "506");
    assert_eq!(key.date_segment(), "010125");
    assert_eq!(key.issuer_segment(), "000123456789");
    assert_eq!(key.consecutive_segment(), "00100001010000000001");
    assert_eq!(key.situation_segment(), "1");
    assert_eq!(key.security_code(), "12345678");
    assert_eq!(
        key.as_str(),
        "50601012500012345678900100001010000000001112345678"
    );
    assert_eq!(key.emission_date(), Some(date));
    assert_eq!(key.consecutive(), Some(consecutive()));
}

#[test]
fn generated_keys_differ_only_in_security_code() {
    let issuer = IssuerIdentification::new(IdentificationType::Juridica, "3-101-123456").unwrap();
    let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
    let a = DocumentKey::generate(&issuer, date, &consecutive(), Situation::Contingencia).unwrap();
    let b = DocumentKey::generate(&issuer, date, &consecutive(), Situation::Contingencia).unwrap();
    assert_eq!(a.as_str()[..42], b.as_str()[..42]);
    assert_eq!(a.situation(), Some(Situation::Contingencia));
}

#[test]
fn identification_width_is_checked() {
    let err = IssuerIdentification::new(IdentificationType::Juridica, "123456789").unwrap_err();
    assert!(matches!(err, KeyError::InvalidIdentification { .. }));
    assert!(IssuerIdentification::new(IdentificationType::Dimex, "123456789012").is_ok());
    assert!(IssuerIdentification::new(IdentificationType::Dimex, "1234567890123").is_err());
}

#[test]
fn keys_round_trip_through_serde() {
    let key: DocumentKey = "50601012500012345678900100001010000000001112345678"
        .parse()
        .unwrap();
    let json = serde_json::to_string(&key).unwrap();
    assert_eq!(json, "\"50601012500012345678900100001010000000001112345678\"");
    assert!(serde_json::from_str::<DocumentKey>("\"50601\"").is_err());
    assert_eq!(
        key.qr_payload(11_300_000, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
        "50601012500012345678900100001010000000001112345678|2025-01-01|113000.00"
    );
}

proptest! {
    #[test]
    fn generate_always_yields_fifty_digits(
        id in 100_000_000u64..=999_999_999,
        days in 0i64..36_000,
        situation in 1u8..=3,
    ) {
        let issuer = IssuerIdentification::new(IdentificationType::Fisica, &id.to_string()).unwrap();
        let date = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap() + chrono::Duration::days(days);
        let situation = Situation::from_digit(char::from(b'0' + situation)).unwrap();
        let key = DocumentKey::generate(&issuer, date, &consecutive(), situation).unwrap();
        prop_assert_eq!(key.as_str().len(), 50);
        prop_assert!(key.as_str().bytes().all(|b| b.is_ascii_digit()));
        prop_assert_eq!(key.emission_date(), Some(date));
        let reparsed: DocumentKey = key.as_str().parse().unwrap();
        prop_assert_eq!(reparsed, key);
    }
}

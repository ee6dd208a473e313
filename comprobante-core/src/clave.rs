//! The 50-digit document key ("clave").
//!
//! | segment       | digits | content                                   |
//! |---------------|--------|-------------------------------------------|
//! | country       | 3      | `506`                                     |
//! | date          | 6      | emission date, `DDMMYY`                   |
//! | issuer        | 12     | identification number, zero-padded        |
//! | consecutive   | 20     | [`ConsecutiveNumber`]                     |
//! | situation     | 1      | [`Situation`]                             |
//! | security code | 8      | random digits, fresh for every document   |
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consecutive::ConsecutiveNumber;

pub const COUNTRY_CODE: &str = "506";
pub const KEY_LENGTH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid {id_type} identification: {reason}")]
    InvalidIdentification {
        id_type: IdentificationType,
        reason: String,
    },
    #[error("unknown identification type: {0}")]
    UnknownIdentificationType(String),
    #[error("invalid situation: {0}")]
    InvalidSituation(String),
    #[error("security code must be exactly 8 digits")]
    InvalidSecurityCode,
    #[error("emission year {0} cannot be encoded as YY")]
    DateOutOfRange(i32),
    #[error("malformed clave: {0}")]
    Malformed(String),
}

/// Issuer identification type, with the Hacienda catalog codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentificationType {
    /// Cédula física.
    Fisica,
    /// Cédula jurídica.
    Juridica,
    Dimex,
    Nite,
}

impl IdentificationType {
    pub fn code(&self) -> &'static str {
        match self {
            IdentificationType::Fisica => "01",
            IdentificationType::Juridica => "02",
            IdentificationType::Dimex => "03",
            IdentificationType::Nite => "04",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentificationType::Fisica => "fisica",
            IdentificationType::Juridica => "juridica",
            IdentificationType::Dimex => "dimex",
            IdentificationType::Nite => "nite",
        }
    }

    /// Accepted digit counts.
    pub fn widths(&self) -> std::ops::RangeInclusive<usize> {
        match self {
            IdentificationType::Fisica => 9..=9,
            IdentificationType::Juridica | IdentificationType::Nite => 10..=10,
            IdentificationType::Dimex => 11..=12,
        }
    }
}

impl fmt::Display for IdentificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentificationType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "01" | "fisica" => Ok(IdentificationType::Fisica),
            "02" | "juridica" => Ok(IdentificationType::Juridica),
            "03" | "dimex" => Ok(IdentificationType::Dimex),
            "04" | "nite" => Ok(IdentificationType::Nite),
            _ => Err(KeyError::UnknownIdentificationType(s.to_owned())),
        }
    }
}

/// A validated issuer identification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssuerIdentification {
    id_type: IdentificationType,
    number: String,
}

impl IssuerIdentification {
    /// Hyphens and spaces are ignored (`1-2345-6789` is a valid física id).
    pub fn new(id_type: IdentificationType, number: &str) -> Result<Self, KeyError> {
        let digits: String = number.chars().filter(|c| !matches!(c, '-' | ' ')).collect();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KeyError::InvalidIdentification {
                id_type,
                reason: "only digits, hyphens and spaces are allowed".into(),
            });
        }
        let widths = id_type.widths();
        if !widths.contains(&digits.len()) {
            let expected = if widths.start() == widths.end() {
                widths.start().to_string()
            } else {
                format!("{}-{}", widths.start(), widths.end())
            };
            return Err(KeyError::InvalidIdentification {
                id_type,
                reason: format!("expected {expected} digits, got {}", digits.len()),
            });
        }
        Ok(Self {
            id_type,
            number: digits,
        })
    }

    pub fn id_type(&self) -> IdentificationType {
        self.id_type
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    /// The 12-digit clave segment.
    pub fn padded(&self) -> String {
        format!("{:0>12}", self.number)
    }
}

/// Emission situation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Situation {
    #[default]
    Normal,
    Contingencia,
    SinInternet,
}

impl Situation {
    pub fn digit(&self) -> char {
        match self {
            Situation::Normal => '1',
            Situation::Contingencia => '2',
            Situation::SinInternet => '3',
        }
    }

    pub fn from_digit(digit: char) -> Result<Self, KeyError> {
        match digit {
            '1' => Ok(Situation::Normal),
            '2' => Ok(Situation::Contingencia),
            '3' => Ok(Situation::SinInternet),
            other => Err(KeyError::InvalidSituation(other.to_string())),
        }
    }
}

impl FromStr for Situation {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "normal" => Ok(Situation::Normal),
            "2" | "contingencia" => Ok(Situation::Contingencia),
            "3" | "sin_internet" | "sininternet" => Ok(Situation::SinInternet),
            _ => Err(KeyError::InvalidSituation(s.to_owned())),
        }
    }
}

/// Eight random digits.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityCode(String);

impl SecurityCode {
    /// Draws from the operating system RNG.
    pub fn random() -> Self {
        let value: u32 = OsRng.gen_range(0..100_000_000);
        Self(format!("{value:08}"))
    }

    pub fn new(code: &str) -> Result<Self, KeyError> {
        if code.len() == 8 && code.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(code.to_owned()))
        } else {
            Err(KeyError::InvalidSecurityCode)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecurityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecurityCode").field(&self.0).finish()
    }
}

/// A validated 50-digit clave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Key with a freshly drawn security code.
    pub fn generate(
        issuer: &IssuerIdentification,
        emission_date: NaiveDate,
        consecutive: &ConsecutiveNumber,
        situation: Situation,
    ) -> Result<Self, KeyError> {
        Self::assemble(
            issuer,
            emission_date,
            consecutive,
            situation,
            &SecurityCode::random(),
        )
    }

    pub fn assemble(
        issuer: &IssuerIdentification,
        emission_date: NaiveDate,
        consecutive: &ConsecutiveNumber,
        situation: Situation,
        security_code: &SecurityCode,
    ) -> Result<Self, KeyError> {
        if !(2000..=2099).contains(&emission_date.year()) {
            return Err(KeyError::DateOutOfRange(emission_date.year()));
        }
        let key = format!(
            "{COUNTRY_CODE}{}{}{}{}{}",
            emission_date.format("%d%m%y"),
            issuer.padded(),
            consecutive,
            situation.digit(),
            security_code.as_str()
        );
        if key.len() != KEY_LENGTH || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KeyError::Malformed(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn country(&self) -> &str {
        &self.0[0..3]
    }

    /// `DDMMYY`.
    pub fn date_segment(&self) -> &str {
        &self.0[3..9]
    }

    pub fn issuer_segment(&self) -> &str {
        &self.0[9..21]
    }

    pub fn consecutive_segment(&self) -> &str {
        &self.0[21..41]
    }

    pub fn situation_segment(&self) -> &str {
        &self.0[41..42]
    }

    pub fn security_code(&self) -> &str {
        &self.0[42..50]
    }

    pub fn emission_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&format!("{}20{}", &self.0[3..7], &self.0[7..9]), "%d%m%Y").ok()
    }

    pub fn consecutive(&self) -> Option<ConsecutiveNumber> {
        self.consecutive_segment().parse().ok()
    }

    pub fn situation(&self) -> Option<Situation> {
        self.situation_segment()
            .chars()
            .next()
            .and_then(|c| Situation::from_digit(c).ok())
    }

    /// `clave|YYYY-MM-DD|total` as encoded in the printed representation's QR code.
    ///
    /// `total_cents` is the document total in céntimos.
    pub fn qr_payload(&self, total_cents: u64, date: NaiveDate) -> String {
        format!(
            "{}|{}|{}.{:02}",
            self.0,
            date.format("%Y-%m-%d"),
            total_cents / 100,
            total_cents % 100
        )
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocumentKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != KEY_LENGTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KeyError::Malformed(format!("expected {KEY_LENGTH} digits")));
        }
        let key = Self(s.to_owned());
        if key.country() != COUNTRY_CODE {
            return Err(KeyError::Malformed(format!(
                "country code {} is not {COUNTRY_CODE}",
                key.country()
            )));
        }
        if key.emission_date().is_none() {
            return Err(KeyError::Malformed(format!(
                "invalid emission date {}",
                key.date_segment()
            )));
        }
        if key.consecutive().is_none() {
            return Err(KeyError::Malformed(format!(
                "invalid consecutive number {}",
                key.consecutive_segment()
            )));
        }
        if key.situation().is_none() {
            return Err(KeyError::Malformed(format!(
                "invalid situation {}",
                key.situation_segment()
            )));
        }
        Ok(key)
    }
}

impl TryFrom<String> for DocumentKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DocumentKey> for String {
    fn from(key: DocumentKey) -> Self {
        key.0
    }
}

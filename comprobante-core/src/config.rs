//! Signing and certificate-reporting configuration.
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Costa Rica (UTC-06:00, no daylight saving).
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = -360;
pub const DEFAULT_EXPIRY_WARNING_DAYS: [u32; 3] = [30, 15, 7];
pub const DEFAULT_MIN_RSA_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Explicit signature policy.
///
/// When configured, signatures carry a `SignaturePolicyIdentifier` naming the policy document
/// and the base64 SHA-256 digest of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePolicy {
    pub identifier: String,
    pub digest_value: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Configuration for certificate checks and the signature builder.
///
/// Every field has a default, so an empty TOML document is a valid configuration.
///
/// # Examples
/// ```rust
/// use comprobante_core::config::Config;
///
/// let config = Config::from_toml("include_chain = true\nexpiry_warning_days = [60, 30, 10]")?;
/// assert!(config.include_chain());
/// assert_eq!(config.utc_offset_minutes(), -360);
/// # Ok::<(), comprobante_core::config::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    utc_offset_minutes: i32,
    /// Info, warning and critical thresholds, in days before expiry.
    expiry_warning_days: [u32; 3],
    include_chain: bool,
    min_rsa_bits: usize,
    signature_policy: Option<SignaturePolicy>,
    xsd_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            utc_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
            expiry_warning_days: DEFAULT_EXPIRY_WARNING_DAYS,
            include_chain: false,
            min_rsa_bits: DEFAULT_MIN_RSA_BITS,
            signature_policy: None,
            xsd_dir: None,
        }
    }
}

impl Config {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&input)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(ConfigError::Invalid(format!(
                "utc_offset_minutes {} is outside +/-840",
                self.utc_offset_minutes
            )));
        }
        let [info, warning, critical] = self.expiry_warning_days;
        if critical == 0 || !(info >= warning && warning >= critical) {
            return Err(ConfigError::Invalid(
                "expiry_warning_days must be positive and in descending order".into(),
            ));
        }
        if self.min_rsa_bits < 1024 {
            return Err(ConfigError::Invalid("min_rsa_bits must be at least 1024".into()));
        }
        if let Some(policy) = &self.signature_policy {
            if policy.identifier.trim().is_empty() || policy.digest_value.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "signature_policy needs an identifier and a digest_value".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn utc_offset_minutes(&self) -> i32 {
        self.utc_offset_minutes
    }

    pub fn expiry_warning_days(&self) -> [u32; 3] {
        self.expiry_warning_days
    }

    pub fn include_chain(&self) -> bool {
        self.include_chain
    }

    pub fn min_rsa_bits(&self) -> usize {
        self.min_rsa_bits
    }

    pub fn signature_policy(&self) -> Option<&SignaturePolicy> {
        self.signature_policy.as_ref()
    }

    pub fn xsd_dir(&self) -> Option<&Path> {
        self.xsd_dir.as_deref()
    }

    /// Signing-time offset. Falls back to UTC for an offset that slipped past validation.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or(Utc.fix())
    }

    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    pub fn with_expiry_warning_days(mut self, days: [u32; 3]) -> Self {
        self.expiry_warning_days = days;
        self
    }

    pub fn with_include_chain(mut self, include: bool) -> Self {
        self.include_chain = include;
        self
    }

    pub fn with_min_rsa_bits(mut self, bits: usize) -> Self {
        self.min_rsa_bits = bits;
        self
    }

    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature_policy = Some(policy);
        self
    }

    pub fn with_xsd_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.xsd_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn parses_policy_table() {
        let config = Config::from_toml(
            r#"
utc_offset_minutes = 0
min_rsa_bits = 3072

[signature_policy]
identifier = "https://example.invalid/politica.pdf"
digest_value = "V8lVVNGDCPen6VELRD1Ja8HARFk="
"#,
        )
        .unwrap();
        assert_eq!(config.utc_offset_minutes(), 0);
        assert_eq!(config.min_rsa_bits(), 3072);
        let policy = config.signature_policy().unwrap();
        assert_eq!(policy.identifier, "https://example.invalid/politica.pdf");
        assert!(policy.description.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Config::from_toml("utc_offset_minutes = 900"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("expiry_warning_days = [7, 15, 30]"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("expiry_warning_days = [30, 15, 0]"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("unknown_field = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = Config::from_file(Path::new("/nonexistent/comprobante.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn offset_defaults_to_costa_rica() {
        assert_eq!(Config::default().utc_offset().local_minus_utc(), -6 * 3600);
    }
}

//! XAdES-BES signature verification.
//!
//! Verification never fails with an error: every problem is reported as a
//! [`VerificationOutcome`]. Reference transforms are limited to enveloped-signature and
//! exclusive c14n, which is what the signer in this crate and Hacienda's own tooling emit.
use base64ct::{Base64, Encoding};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use x509_cert::der::Decode;
use x509_cert::Certificate;

use super::c14n::{CanonicalizationError, Canonicalizer};
use super::xml::constants::{
    DS_NS, ENVELOPED_SIGNATURE, EXC_C14N, SHA256_DIGEST, SIGNED_PROPERTIES_TYPE,
};
use super::xml::{parse_document, Document, Element};
use crate::certificate::{
    serial_bytes_to_decimal_string, validity_window, PublicKey, SignatureAlgorithm,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Valid,
    /// A reference digest does not match; `reference` is the reference `Id`, or its `URI`.
    DigestMismatch { reference: String },
    SignatureInvalid,
    CertificateExpiredAtSigning,
    CertificateNotYetValidAtSigning,
    /// The `xades:SigningCertificate` digest or issuer/serial does not match `KeyInfo`.
    SigningCertificateMismatch,
    UnsupportedAlgorithm { uri: String },
    Malformed { reason: String },
}

/// Outcome plus whatever signer details could be read before the check ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub outcome: VerificationOutcome,
    pub signer_subject: Option<String>,
    pub signer_issuer: Option<String>,
    pub signing_time: Option<DateTime<FixedOffset>>,
    pub algorithm: Option<SignatureAlgorithm>,
}

impl VerificationResult {
    fn new() -> Self {
        Self {
            outcome: VerificationOutcome::Valid,
            signer_subject: None,
            signer_issuer: None,
            signing_time: None,
            algorithm: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.outcome == VerificationOutcome::Valid
    }
}

/// Parses and verifies a signed document.
pub fn verify(xml: &str) -> VerificationResult {
    match parse_document(xml) {
        Ok(document) => verify_document(&document),
        Err(err) => {
            let mut result = VerificationResult::new();
            result.outcome = malformed(err.to_string());
            result
        }
    }
}

pub fn verify_document(document: &Document) -> VerificationResult {
    let mut result = VerificationResult::new();
    if let Err(outcome) = check(document, &mut result) {
        debug!(?outcome, "signature rejected");
        result.outcome = outcome;
    }
    result
}

fn malformed(reason: impl Into<String>) -> VerificationOutcome {
    VerificationOutcome::Malformed {
        reason: reason.into(),
    }
}

fn from_c14n(err: CanonicalizationError) -> VerificationOutcome {
    malformed(err.to_string())
}

fn require<'a>(parent: &'a Element, name: &str) -> Result<&'a Element, VerificationOutcome> {
    parent
        .child(name)
        .ok_or_else(|| malformed(format!("<{}> has no {name} child", parent.qualified_name())))
}

fn algorithm_of(el: &Element) -> Result<&str, VerificationOutcome> {
    el.attribute("Algorithm")
        .ok_or_else(|| malformed(format!("<{}> has no Algorithm", el.qualified_name())))
}

fn unsupported(uri: &str) -> VerificationOutcome {
    VerificationOutcome::UnsupportedAlgorithm {
        uri: uri.to_owned(),
    }
}

/// Base64 text with embedded whitespace (line-wrapped values are common).
fn decode_base64(el: &Element) -> Result<Vec<u8>, VerificationOutcome> {
    let compact: String = el.text().chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Base64::decode_vec(&compact)
        .map_err(|_| malformed(format!("<{}> is not valid base64", el.qualified_name())))
}

fn collect_named<'a>(el: &'a Element, name: &str, out: &mut Vec<&'a Element>) {
    for child in el.child_elements() {
        if child.name() == name {
            out.push(child);
        }
        collect_named(child, name, out);
    }
}

/// The signature's only `SignedProperties`, which must sit at
/// `Object/QualifyingProperties/SignedProperties` with `Target` naming this signature.
fn signed_properties_of(signature: &Element) -> Result<Option<&Element>, VerificationOutcome> {
    let mut found = Vec::new();
    collect_named(signature, "SignedProperties", &mut found);
    let candidate = match found.as_slice() {
        [] => return Ok(None),
        [one] => *one,
        _ => return Err(malformed("signature carries more than one SignedProperties")),
    };
    let qualifying = signature
        .child_elements()
        .filter(|el| el.name() == "Object")
        .flat_map(|object| object.child_elements())
        .filter(|el| el.name() == "QualifyingProperties")
        .find(|qp| qp.child_elements().any(|el| std::ptr::eq(el, candidate)))
        .ok_or_else(|| malformed("SignedProperties is not under Object/QualifyingProperties"))?;
    if let (Some(target), Some(id)) = (qualifying.attribute("Target"), signature.id()) {
        if target.strip_prefix('#') != Some(id) {
            return Err(malformed(format!(
                "QualifyingProperties targets {target}, not this signature"
            )));
        }
    }
    Ok(Some(candidate))
}

/// First descendant of `el` (depth first) with local name `name`.
fn descendant<'a>(el: &'a Element, name: &str) -> Option<&'a Element> {
    el.child_elements()
        .find_map(|child| (child.name() == name).then_some(child).or_else(|| descendant(child, name)))
}

fn check(document: &Document, result: &mut VerificationResult) -> Result<(), VerificationOutcome> {
    let path = document
        .find_element(DS_NS, "Signature")
        .map_err(|err| malformed(err.to_string()))?
        .ok_or_else(|| malformed("document has no ds:Signature"))?;
    let signature = document
        .element_at(&path)
        .ok_or_else(|| malformed("signature element vanished"))?;
    let signed_info = require(signature, "SignedInfo")?;

    let c14n_method = algorithm_of(require(signed_info, "CanonicalizationMethod")?)?;
    if c14n_method != EXC_C14N {
        return Err(unsupported(c14n_method));
    }
    let method_uri = algorithm_of(require(signed_info, "SignatureMethod")?)?;
    let algorithm = SignatureAlgorithm::from_uri(method_uri).ok_or_else(|| unsupported(method_uri))?;
    result.algorithm = Some(algorithm);

    let c14n = Canonicalizer::exclusive();
    let signed_properties = signed_properties_of(signature)?;
    let properties_id = signed_properties.and_then(|sp| sp.id());
    let mut covers_document = false;
    let mut covers_properties = false;
    for reference in signed_info.child_elements().filter(|el| el.name() == "Reference") {
        let uri = reference
            .attribute("URI")
            .ok_or_else(|| malformed("reference without URI"))?;
        let label = reference.id().unwrap_or(uri).to_owned();

        let digest_method = algorithm_of(require(reference, "DigestMethod")?)?;
        if digest_method != SHA256_DIGEST {
            return Err(unsupported(digest_method));
        }
        let mut enveloped = false;
        if let Some(transforms) = reference.child("Transforms") {
            for transform in transforms.child_elements() {
                match algorithm_of(transform)? {
                    ENVELOPED_SIGNATURE => enveloped = true,
                    EXC_C14N => {}
                    other => return Err(unsupported(other)),
                }
            }
        }

        let canonical = if uri.is_empty() {
            covers_document = true;
            if enveloped {
                c14n.canonicalize_without(document, signature)
            } else {
                c14n.canonicalize(document)
            }
        } else if let Some(id) = uri.strip_prefix('#') {
            let targets_properties = properties_id == Some(id);
            if reference.attribute("Type") == Some(SIGNED_PROPERTIES_TYPE) && !targets_properties {
                return Err(malformed(format!(
                    "SignedProperties reference {uri} does not point at the SignedProperties"
                )));
            }
            covers_properties |= targets_properties;
            c14n.canonicalize_fragment(document, id)
        } else {
            return Err(malformed(format!("external reference {uri} is not supported")));
        }
        .map_err(from_c14n)?;

        let expected = decode_base64(require(reference, "DigestValue")?)?;
        if canonical.sha256().as_slice() != expected.as_slice() {
            return Err(VerificationOutcome::DigestMismatch { reference: label });
        }
    }
    if !covers_document {
        return Err(malformed("signature does not reference the document"));
    }
    if signed_properties.is_some() && !covers_properties {
        return Err(malformed("SignedProperties is not referenced"));
    }

    let key_info = require(signature, "KeyInfo")?;
    let mut certificates = Vec::new();
    for el in key_info
        .child_elements()
        .filter(|el| el.name() == "X509Data")
        .flat_map(|data| data.child_elements())
        .filter(|el| el.name() == "X509Certificate")
    {
        let der = decode_base64(el)?;
        let cert = Certificate::from_der(&der)
            .map_err(|_| malformed("X509Certificate is not a DER certificate"))?;
        certificates.push((der, cert));
    }
    if certificates.is_empty() {
        return Err(malformed("KeyInfo carries no X509Certificate"));
    }

    let signing_certificate = signed_properties
        .and_then(|sp| descendant(sp, "SigningCertificate").or_else(|| descendant(sp, "SigningCertificateV2")));
    let cert = match signing_certificate {
        Some(signing_certificate) => {
            let cert_ref = require(signing_certificate, "Cert")?;
            let cert_digest = require(cert_ref, "CertDigest")?;
            let method = algorithm_of(require(cert_digest, "DigestMethod")?)?;
            if method != SHA256_DIGEST {
                return Err(unsupported(method));
            }
            let expected = decode_base64(require(cert_digest, "DigestValue")?)?;
            let (_, cert) = certificates
                .iter()
                .find(|(der, _)| Sha256::digest(der).as_slice() == expected.as_slice())
                .ok_or(VerificationOutcome::SigningCertificateMismatch)?;
            if let Some(issuer_serial) = cert_ref.child("IssuerSerial") {
                check_issuer_serial(issuer_serial, cert)?;
            }
            cert
        }
        None if signed_properties.is_some() => {
            return Err(malformed("SignedProperties lacks SigningCertificate"))
        }
        None => &certificates[0].1,
    };
    result.signer_subject = Some(cert.tbs_certificate.subject.to_string());
    result.signer_issuer = Some(cert.tbs_certificate.issuer.to_string());

    let public = PublicKey::from_certificate(cert).map_err(|err| match err {
        crate::certificate::CertificateError::UnsupportedKey { algorithm } => {
            VerificationOutcome::UnsupportedAlgorithm { uri: algorithm }
        }
        other => malformed(other.to_string()),
    })?;
    if public.algorithm() != algorithm {
        return Err(VerificationOutcome::SignatureInvalid);
    }
    let signature_value = decode_base64(require(signature, "SignatureValue")?)?;
    let signed_info_bytes = c14n
        .canonicalize_subtree(document, signed_info)
        .map_err(from_c14n)?
        .ok_or_else(|| malformed("SignedInfo not reachable"))?;
    if !public.verify(signed_info_bytes.as_bytes(), &signature_value) {
        return Err(VerificationOutcome::SignatureInvalid);
    }

    if let Some(time) = signed_properties.and_then(|sp| descendant(sp, "SigningTime")) {
        let text = time.text();
        let signing_time = DateTime::parse_from_rfc3339(text.trim())
            .map_err(|_| malformed(format!("SigningTime '{}' is not RFC 3339", text.trim())))?;
        result.signing_time = Some(signing_time);
        let (not_before, not_after) =
            validity_window(cert).map_err(|err| malformed(err.to_string()))?;
        let at = signing_time.with_timezone(&Utc);
        if at > not_after {
            return Err(VerificationOutcome::CertificateExpiredAtSigning);
        }
        if at < not_before {
            return Err(VerificationOutcome::CertificateNotYetValidAtSigning);
        }
    }
    Ok(())
}

fn check_issuer_serial(issuer_serial: &Element, cert: &Certificate) -> Result<(), VerificationOutcome> {
    let serial = require(issuer_serial, "X509SerialNumber")?.text();
    let expected_serial = serial_bytes_to_decimal_string(cert.tbs_certificate.serial_number.as_bytes());
    if serial.trim() != expected_serial {
        return Err(VerificationOutcome::SigningCertificateMismatch);
    }
    let issuer = require(issuer_serial, "X509IssuerName")?.text();
    if normalize_name(&issuer) != normalize_name(&cert.tbs_certificate.issuer.to_string()) {
        return Err(VerificationOutcome::SigningCertificateMismatch);
    }
    Ok(())
}

/// Order- and spacing-insensitive form of an RFC 4514 name. Escaped commas are not split on.
fn normalize_name(name: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in name.chars() {
        match c {
            ',' | '+' if !escaped => parts.push(std::mem::take(&mut current)),
            '\\' if !escaped => {
                escaped = true;
                current.push(c);
                continue;
            }
            _ => current.push(c),
        }
        escaped = false;
    }
    parts.push(current);
    let mut parts: Vec<String> = parts
        .into_iter()
        .map(|part| match part.split_once('=') {
            Some((key, value)) => format!("{}={}", key.trim().to_ascii_lowercase(), value.trim()),
            None => part.trim().to_owned(),
        })
        .filter(|part| !part.is_empty())
        .collect();
    parts.sort();
    parts
}

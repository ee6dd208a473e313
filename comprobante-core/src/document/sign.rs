//! XAdES-BES enveloped signatures.
//!
//! The signer normalizes the document (see [`c14n`](super::c14n)), appends a `ds:Signature`
//! as the last child of the root and emits the canonical bytes of the result. Because the
//! emitted text is already canonical, any exclusive-c14n verifier reproduces both digests.
//!
//! Signature layout:
//!
//! ```text
//! ds:Signature Id
//!   ds:SignedInfo
//!     ds:CanonicalizationMethod       exc-c14n
//!     ds:SignatureMethod              rsa-sha256 | ecdsa-sha256
//!     ds:Reference Id URI=""          enveloped-signature, exc-c14n, sha256
//!     ds:Reference Type URI="#sp"     exc-c14n, sha256
//!   ds:SignatureValue Id
//!   ds:KeyInfo Id / ds:X509Data / ds:X509Certificate+
//!   ds:Object / xades:QualifyingProperties Target
//!     xades:SignedProperties Id
//!       xades:SignedSignatureProperties
//!         xades:SigningTime
//!         xades:SigningCertificate / xades:Cert / (CertDigest, IssuerSerial)
//!         xades:SignaturePolicyIdentifier   (only with a configured policy)
//!       xades:SignedDataObjectProperties / xades:DataObjectFormat
//! ```
use base64ct::{Base64, Encoding};
use chrono::{DateTime, FixedOffset, SubsecRound, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::c14n::{CanonicalizationError, Canonicalizer};
use super::verify::{verify_document, VerificationOutcome};
use super::xml::constants::{
    DS_NS, ENVELOPED_SIGNATURE, EXC_C14N, SHA256_DIGEST, SIGNED_PROPERTIES_TYPE, XADES_NS,
};
use super::xml::{parse_document, Document, Element, XmlError};
use crate::certificate::{
    CertificateCredential, CertificateError, ExpirationWarning, PublicKey, SignatureAlgorithm,
};
use crate::config::{Config, SignaturePolicy};

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("credential cannot sign at this time")]
    CertificateInvalid(#[source] CertificateError),
    #[error("self-check of the signed document failed: {reason}")]
    DigestMismatchInternal { reason: String },
    #[error("unsupported signature algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
    #[error("document already contains a ds:Signature")]
    AlreadySigned,
    #[error("document has no root element")]
    MissingRoot,
    #[error(transparent)]
    Xml(XmlError),
    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),
    #[error("signing operation failed")]
    Crypto(#[source] CertificateError),
}

impl From<XmlError> for SignatureError {
    fn from(err: XmlError) -> Self {
        match err {
            XmlError::MissingRoot => SignatureError::MissingRoot,
            other => SignatureError::Xml(other),
        }
    }
}

/// Output of [`DocumentSigner::sign`]. The XML text is final: changing it breaks the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    xml: String,
    signature_id: String,
    document_digest: String,
    signed_properties_digest: String,
    signature_value: String,
    signing_time: DateTime<FixedOffset>,
    algorithm: SignatureAlgorithm,
}

impl SignedDocument {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.xml.as_bytes()
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    pub fn signature_id(&self) -> &str {
        &self.signature_id
    }

    /// Base64 SHA-256 of the canonical document without its signature.
    pub fn document_digest(&self) -> &str {
        &self.document_digest
    }

    pub fn signed_properties_digest(&self) -> &str {
        &self.signed_properties_digest
    }

    /// Base64 `SignatureValue`.
    pub fn signature_value(&self) -> &str {
        &self.signature_value
    }

    pub fn signing_time(&self) -> DateTime<FixedOffset> {
        self.signing_time
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }
}

/// Identifiers shared by one signature's elements.
struct SignatureIds {
    signature: String,
    reference: String,
    signed_properties: String,
    signature_value: String,
    key_info: String,
}

impl SignatureIds {
    fn fresh() -> Self {
        let suffix = format!("{:016x}", rand::random::<u64>());
        Self {
            signature: format!("Signature-{suffix}"),
            reference: format!("Reference-{suffix}"),
            signed_properties: format!("SignedProperties-{suffix}"),
            signature_value: format!("SignatureValue-{suffix}"),
            key_info: format!("KeyInfo-{suffix}"),
        }
    }
}

/// Builds XAdES-BES signatures.
#[derive(Debug, Clone, Default)]
pub struct DocumentSigner {
    config: Config,
}

impl DocumentSigner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sign(
        &self,
        document: &Document,
        credential: &CertificateCredential,
    ) -> Result<SignedDocument, SignatureError> {
        self.sign_at(document, credential, Utc::now())
    }

    /// Parses `xml` and signs it.
    pub fn sign_xml(
        &self,
        xml: &str,
        credential: &CertificateCredential,
    ) -> Result<SignedDocument, SignatureError> {
        let document = parse_document(xml)?;
        self.sign(&document, credential)
    }

    /// Signs with an explicit signing time (truncated to whole seconds).
    pub fn sign_at(
        &self,
        document: &Document,
        credential: &CertificateCredential,
        signing_time: DateTime<Utc>,
    ) -> Result<SignedDocument, SignatureError> {
        let signing_time = signing_time.trunc_subsecs(0);
        credential
            .check_valid_at(signing_time)
            .map_err(SignatureError::CertificateInvalid)?;
        let warning = ExpirationWarning::classify(
            credential.not_after(),
            signing_time,
            self.config.expiry_warning_days(),
        );
        if warning != ExpirationWarning::None {
            warn!(subject = credential.subject(), ?warning, "signing with a certificate close to expiry");
        }

        let algorithm = match PublicKey::from_certificate(credential.certificate()) {
            Ok(public) if public.algorithm() == credential.algorithm() => credential.algorithm(),
            Ok(public) => {
                return Err(SignatureError::UnsupportedAlgorithm {
                    algorithm: format!("{:?} certificate with {:?} key", public.algorithm(), credential.algorithm()),
                })
            }
            Err(CertificateError::UnsupportedKey { algorithm }) => {
                return Err(SignatureError::UnsupportedAlgorithm { algorithm })
            }
            Err(other) => return Err(SignatureError::CertificateInvalid(other)),
        };

        if document.find_element(DS_NS, "Signature")?.is_some() {
            return Err(SignatureError::AlreadySigned);
        }

        let mut signed = Canonicalizer::for_document(document)?.normalize(document)?;
        let ids = SignatureIds::fresh();
        let local_time = signing_time.with_timezone(&self.config.utc_offset());

        let signed_properties = signed_properties_element(
            &ids,
            &local_time,
            credential,
            self.config.signature_policy(),
        );
        signed.root_mut().push_child(signature_scaffold(
            &ids,
            algorithm,
            signed_properties,
            key_info_element(&ids, credential, self.config.include_chain()),
        ));

        // Every node is now in canonical form, so plain exclusive c14n is enough from here on.
        let c14n = Canonicalizer::exclusive();
        let document_digest = c14n
            .canonicalize_excluding(&signed, &ids.signature)?
            .digest_base64();
        let signed_properties_digest = c14n
            .canonicalize_fragment(&signed, &ids.signed_properties)?
            .digest_base64();
        debug!(
            signature_id = %ids.signature,
            document_digest = %document_digest,
            signed_properties_digest = %signed_properties_digest,
            "reference digests computed"
        );

        let signature = last_signature_mut(&mut signed)?;
        let mut references = signature
            .child_mut("SignedInfo")
            .map(|si| si.children_mut().iter_mut())
            .into_iter()
            .flatten()
            .filter_map(|node| match node {
                super::xml::Node::Element(el) if el.name() == "Reference" => Some(el),
                _ => None,
            });
        for digest in [&document_digest, &signed_properties_digest] {
            let reference = references.next().ok_or_else(|| internal("reference missing"))?;
            reference
                .child_mut("DigestValue")
                .ok_or_else(|| internal("DigestValue missing"))?
                .set_text(digest.as_str());
        }
        drop(references);

        let signed_info = last_signature(&signed)?
            .child("SignedInfo")
            .ok_or_else(|| internal("SignedInfo missing"))?;
        let signed_info_bytes = c14n
            .canonicalize_subtree(&signed, signed_info)?
            .ok_or_else(|| internal("SignedInfo not reachable"))?;
        let raw_signature = credential
            .sign(signed_info_bytes.as_bytes())
            .map_err(SignatureError::Crypto)?;
        let signature_value = Base64::encode_string(&raw_signature);
        last_signature_mut(&mut signed)?
            .child_mut("SignatureValue")
            .ok_or_else(|| internal("SignatureValue missing"))?
            .set_text(signature_value.as_str());

        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>{}",
            c14n.canonicalize(&signed)?.as_str()
        );

        let reparsed = parse_document(&xml).map_err(|e| internal(e.to_string()))?;
        let check = verify_document(&reparsed);
        if check.outcome != VerificationOutcome::Valid {
            return Err(SignatureError::DigestMismatchInternal {
                reason: format!("{:?}", check.outcome),
            });
        }

        info!(
            signature_id = %ids.signature,
            subject = credential.subject(),
            signing_time = %local_time.to_rfc3339(),
            "document signed"
        );
        Ok(SignedDocument {
            xml,
            signature_id: ids.signature,
            document_digest,
            signed_properties_digest,
            signature_value,
            signing_time: local_time,
            algorithm,
        })
    }
}

fn internal(reason: impl Into<String>) -> SignatureError {
    SignatureError::DigestMismatchInternal {
        reason: reason.into(),
    }
}

fn last_signature(document: &Document) -> Result<&Element, SignatureError> {
    document
        .root()
        .child_elements()
        .last()
        .filter(|el| el.name() == "Signature")
        .ok_or_else(|| internal("signature element missing"))
}

fn last_signature_mut(document: &mut Document) -> Result<&mut Element, SignatureError> {
    document
        .root_mut()
        .children_mut()
        .iter_mut()
        .rev()
        .find_map(|node| match node {
            super::xml::Node::Element(el) => Some(el),
            super::xml::Node::Text(_) => None,
        })
        .filter(|el| el.name() == "Signature")
        .ok_or_else(|| internal("signature element missing"))
}

fn ds(name: &str) -> Element {
    Element::prefixed("ds", name)
}

fn xades(name: &str) -> Element {
    Element::prefixed("xades", name)
}

fn algorithm(el: Element, uri: &str) -> Element {
    el.with_attribute("Algorithm", uri)
}

fn digest_pair(value: &str) -> [Element; 2] {
    [
        algorithm(ds("DigestMethod"), SHA256_DIGEST),
        ds("DigestValue").with_text(value),
    ]
}

fn signature_scaffold(
    ids: &SignatureIds,
    signature_algorithm: SignatureAlgorithm,
    signed_properties: Element,
    key_info: Element,
) -> Element {
    let [method, value] = digest_pair("");
    let document_reference = ds("Reference")
        .with_attribute("Id", ids.reference.as_str())
        .with_attribute("URI", "")
        .with_child(
            ds("Transforms")
                .with_child(algorithm(ds("Transform"), ENVELOPED_SIGNATURE))
                .with_child(algorithm(ds("Transform"), EXC_C14N)),
        )
        .with_child(method)
        .with_child(value);

    let [method, value] = digest_pair("");
    let properties_reference = ds("Reference")
        .with_attribute("Type", SIGNED_PROPERTIES_TYPE)
        .with_attribute("URI", format!("#{}", ids.signed_properties))
        .with_child(ds("Transforms").with_child(algorithm(ds("Transform"), EXC_C14N)))
        .with_child(method)
        .with_child(value);

    let signed_info = ds("SignedInfo")
        .with_child(algorithm(ds("CanonicalizationMethod"), EXC_C14N))
        .with_child(algorithm(ds("SignatureMethod"), signature_algorithm.uri()))
        .with_child(document_reference)
        .with_child(properties_reference);

    ds("Signature")
        .with_namespace(Some("ds"), DS_NS)
        .with_attribute("Id", ids.signature.as_str())
        .with_child(signed_info)
        .with_child(ds("SignatureValue").with_attribute("Id", ids.signature_value.as_str()))
        .with_child(key_info)
        .with_child(
            ds("Object").with_child(
                xades("QualifyingProperties")
                    .with_namespace(Some("xades"), XADES_NS)
                    .with_attribute("Target", format!("#{}", ids.signature))
                    .with_child(signed_properties),
            ),
        )
}

fn key_info_element(
    ids: &SignatureIds,
    credential: &CertificateCredential,
    include_chain: bool,
) -> Element {
    let mut data = ds("X509Data")
        .with_child(ds("X509Certificate").with_text(Base64::encode_string(credential.certificate_der())));
    if include_chain {
        for der in credential.chain_der() {
            data = data.with_child(ds("X509Certificate").with_text(Base64::encode_string(der)));
        }
    }
    ds("KeyInfo")
        .with_attribute("Id", ids.key_info.as_str())
        .with_child(data)
}

fn signed_properties_element(
    ids: &SignatureIds,
    signing_time: &DateTime<FixedOffset>,
    credential: &CertificateCredential,
    policy: Option<&SignaturePolicy>,
) -> Element {
    let cert_digest = Base64::encode_string(&Sha256::digest(credential.certificate_der()));
    let [method, value] = digest_pair(&cert_digest);
    let signing_certificate = xades("SigningCertificate").with_child(
        xades("Cert")
            .with_child(xades("CertDigest").with_child(method).with_child(value))
            .with_child(
                xades("IssuerSerial")
                    .with_child(ds("X509IssuerName").with_text(credential.issuer()))
                    .with_child(ds("X509SerialNumber").with_text(credential.serial_number())),
            ),
    );

    let mut signature_properties = xades("SignedSignatureProperties")
        .with_child(xades("SigningTime").with_text(format_signing_time(signing_time)))
        .with_child(signing_certificate);
    if let Some(policy) = policy {
        signature_properties = signature_properties.with_child(policy_element(policy));
    }

    xades("SignedProperties")
        .with_attribute("Id", ids.signed_properties.as_str())
        .with_child(signature_properties)
        .with_child(
            xades("SignedDataObjectProperties").with_child(
                xades("DataObjectFormat")
                    .with_attribute("ObjectReference", format!("#{}", ids.reference))
                    .with_child(xades("MimeType").with_text("text/xml"))
                    .with_child(xades("Encoding").with_text("UTF-8")),
            ),
        )
}

fn policy_element(policy: &SignaturePolicy) -> Element {
    let mut sig_policy_id = xades("SigPolicyId")
        .with_child(xades("Identifier").with_text(policy.identifier.as_str()));
    if let Some(description) = &policy.description {
        sig_policy_id = sig_policy_id.with_child(xades("Description").with_text(description.as_str()));
    }
    let [method, value] = digest_pair(&policy.digest_value);
    xades("SignaturePolicyIdentifier").with_child(
        xades("SignaturePolicyId")
            .with_child(sig_policy_id)
            .with_child(xades("SigPolicyHash").with_child(method).with_child(value)),
    )
}

fn format_signing_time(time: &DateTime<FixedOffset>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

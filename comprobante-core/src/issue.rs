//! Issuance pipeline: allocate a consecutive number, derive the clave, write the header, sign.
//!
//! A failure before allocation consumes nothing ([`IssueError::Allocation`] and the checks that
//! precede it). Once a number has been issued every failure is reported as
//! [`IssueError::AfterAllocation`], carrying the consumed number so the caller can void it or
//! retry with it. A number is never silently reused.
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info};

use crate::certificate::{CertificateCredential, CertificateError};
use crate::clave::{DocumentKey, IssuerIdentification, KeyError, Situation};
use crate::consecutive::{
    AllocationError, ConsecutiveAllocator, ConsecutiveNumber, CounterStore, Partition,
};
use crate::document::header::write_header;
use crate::document::sign::{DocumentSigner, SignatureError, SignedDocument};
use crate::document::xml::Document;

/// Step that failed after a consecutive number was issued.
#[derive(Debug, Error)]
pub enum IssueStepError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("credential cannot sign at issuance time")]
    CertificateInvalid(#[source] CertificateError),
    #[error("document root <{found}> does not match document type {expected}")]
    DocumentTypeMismatch { expected: &'static str, found: String },
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("issuance failed after consecutive {consecutive} was allocated")]
    AfterAllocation {
        consecutive: ConsecutiveNumber,
        clave: Option<DocumentKey>,
        #[source]
        source: IssueStepError,
    },
}

impl IssueError {
    /// Number consumed by a failed issuance, if any.
    pub fn allocated_consecutive(&self) -> Option<&ConsecutiveNumber> {
        match self {
            IssueError::AfterAllocation { consecutive, .. } => Some(consecutive),
            _ => None,
        }
    }
}

/// Who issues what, and when.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub partition: Partition,
    pub issuer: IssuerIdentification,
    pub situation: Situation,
    pub issued_at: DateTime<Utc>,
}

impl IssueRequest {
    pub fn new(partition: Partition, issuer: IssuerIdentification) -> Self {
        Self {
            partition,
            issuer,
            situation: Situation::default(),
            issued_at: Utc::now(),
        }
    }

    pub fn with_situation(mut self, situation: Situation) -> Self {
        self.situation = situation;
        self
    }

    pub fn at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = issued_at;
        self
    }
}

#[derive(Debug, Clone)]
pub struct IssuedDocument {
    pub clave: DocumentKey,
    pub consecutive: ConsecutiveNumber,
    pub signed: SignedDocument,
}

impl IssuedDocument {
    pub fn xml(&self) -> &str {
        self.signed.xml()
    }
}

pub struct DocumentIssuer<S> {
    allocator: ConsecutiveAllocator<S>,
    signer: DocumentSigner,
}

impl<S: CounterStore> DocumentIssuer<S> {
    pub fn new(allocator: ConsecutiveAllocator<S>, signer: DocumentSigner) -> Self {
        Self { allocator, signer }
    }

    pub fn allocator(&self) -> &ConsecutiveAllocator<S> {
        &self.allocator
    }

    pub fn signer(&self) -> &DocumentSigner {
        &self.signer
    }

    /// Issues `document` without modifying it; the header fields are written on a copy.
    pub fn issue(
        &self,
        request: &IssueRequest,
        document: &Document,
        credential: &CertificateCredential,
    ) -> Result<IssuedDocument, IssueError> {
        credential
            .check_valid_at(request.issued_at)
            .map_err(IssueError::CertificateInvalid)?;
        let expected = request.partition.document_type().root_element();
        if document.root().name() != expected {
            return Err(IssueError::DocumentTypeMismatch {
                expected,
                found: document.root().name().to_owned(),
            });
        }

        let consecutive = self.allocator.allocate(&request.partition)?;

        let emission_date = request
            .issued_at
            .with_timezone(&self.signer.config().utc_offset())
            .date_naive();
        let clave = DocumentKey::generate(&request.issuer, emission_date, &consecutive, request.situation)
            .map_err(|err| after_allocation(&consecutive, None, err.into()))?;

        let mut document = document.clone();
        write_header(&mut document, &clave, &consecutive);
        let signed = self
            .signer
            .sign_at(&document, credential, request.issued_at)
            .map_err(|err| after_allocation(&consecutive, Some(&clave), err.into()))?;

        info!(
            partition = %request.partition,
            consecutive = %consecutive,
            clave = %clave,
            "document issued"
        );
        Ok(IssuedDocument {
            clave,
            consecutive,
            signed,
        })
    }
}

fn after_allocation(
    consecutive: &ConsecutiveNumber,
    clave: Option<&DocumentKey>,
    source: IssueStepError,
) -> IssueError {
    error!(consecutive = %consecutive, error = %source, "issuance failed after allocation");
    IssueError::AfterAllocation {
        consecutive: consecutive.clone(),
        clave: clave.cloned(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clave::IdentificationType;
    use crate::consecutive::{DocumentType, MemoryCounterStore};
    use crate::document::xml::parse_document;
    use chrono::TimeZone;

    const RSA_CERT_PEM: &str = include_str!("../tests/fixtures/certs/rsa-2048.cert.pem");
    const RSA_KEY_PEM: &str = include_str!("../tests/fixtures/certs/rsa-2048.key.pem");

    fn partition() -> Partition {
        Partition::new(
            "tenant-a".into(),
            "001".into(),
            "00001".into(),
            DocumentType::FacturaElectronica,
        )
        .unwrap()
    }

    fn issuer() -> DocumentIssuer<MemoryCounterStore> {
        DocumentIssuer::new(
            ConsecutiveAllocator::new(MemoryCounterStore::new()),
            DocumentSigner::default(),
        )
    }

    fn request(at: DateTime<Utc>) -> IssueRequest {
        IssueRequest::new(
            partition(),
            IssuerIdentification::new(IdentificationType::Fisica, "1-2345-6789").unwrap(),
        )
        .at(at)
    }

    #[test]
    fn expired_credential_consumes_no_number() {
        let credential = CertificateCredential::from_pem(RSA_CERT_PEM, RSA_KEY_PEM).unwrap();
        let document = parse_document("<FacturaElectronica xmlns=\"urn:f\"/>").unwrap();
        let issuer = issuer();
        let late = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();

        let err = issuer.issue(&request(late), &document, &credential).unwrap_err();
        assert!(matches!(err, IssueError::CertificateInvalid(CertificateError::Expired { .. })));
        assert!(err.allocated_consecutive().is_none());
        assert_eq!(issuer.allocator().store().last(&partition()), None);
    }

    #[test]
    fn wrong_root_is_rejected_before_allocation() {
        let credential = CertificateCredential::from_pem(RSA_CERT_PEM, RSA_KEY_PEM).unwrap();
        let document = parse_document("<TiqueteElectronico xmlns=\"urn:t\"/>").unwrap();
        let issuer = issuer();
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();

        let err = issuer.issue(&request(at), &document, &credential).unwrap_err();
        assert!(matches!(
            err,
            IssueError::DocumentTypeMismatch { expected: "FacturaElectronica", .. }
        ));
        assert_eq!(issuer.allocator().store().last(&partition()), None);
    }

    #[test]
    fn after_allocation_exposes_number() {
        let consecutive = ConsecutiveNumber::for_partition(&partition(), 7).unwrap();
        let err = after_allocation(
            &consecutive,
            None,
            KeyError::DateOutOfRange(2100).into(),
        );
        assert_eq!(err.allocated_consecutive(), Some(&consecutive));
    }
}

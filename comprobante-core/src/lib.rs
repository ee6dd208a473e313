//! Signing core for Costa Rican electronic documents (comprobantes electrónicos v4.4):
//! the 50-digit clave, consecutive numbering, canonical XML and XAdES-BES signatures.
//!
//! # Examples
//! ```rust
//! use comprobante_core::consecutive::{
//!     ConsecutiveAllocator, DocumentType, MemoryCounterStore, Partition,
//! };
//!
//! let allocator = ConsecutiveAllocator::new(MemoryCounterStore::new());
//! let partition = Partition::new(
//!     "tenant".into(),
//!     "001".into(),
//!     "00001".into(),
//!     DocumentType::FacturaElectronica,
//! )?;
//! let consecutive = allocator.allocate(&partition)?;
//! assert_eq!(consecutive.to_string(), "00100001010000000001");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
pub mod certificate;
pub mod clave;
pub mod config;
pub mod consecutive;
pub mod document;
pub mod issue;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Certificate(#[from] certificate::CertificateError),
    #[error(transparent)]
    Partition(#[from] consecutive::PartitionError),
    #[error(transparent)]
    Consecutive(#[from] consecutive::ParseConsecutiveError),
    #[error(transparent)]
    DocumentType(#[from] consecutive::UnknownDocumentType),
    #[error(transparent)]
    CounterStore(#[from] consecutive::CounterStoreError),
    #[error(transparent)]
    Allocation(#[from] consecutive::AllocationError),
    #[error(transparent)]
    Key(#[from] clave::KeyError),
    #[error(transparent)]
    Xml(#[from] document::xml::XmlError),
    #[error(transparent)]
    Canonicalization(#[from] document::c14n::CanonicalizationError),
    #[error(transparent)]
    Signature(#[from] document::sign::SignatureError),
    #[error(transparent)]
    Issue(#[from] issue::IssueError),
}

//! Electronic document XML: tree, canonical form, header fields, signing and verification.
pub mod c14n;
pub mod header;
pub mod sign;
#[cfg(feature = "xsd")]
pub mod validation;
pub mod verify;
pub mod xml;

pub use c14n::{canonicalize, canonicalize_fragment, CanonicalBytes, CanonicalizationError, Canonicalizer};
pub use header::write_header;
pub use sign::{DocumentSigner, SignatureError, SignedDocument};
pub use verify::{verify, verify_document, VerificationOutcome, VerificationResult};
pub use xml::{parse_document, Document, Element, Node, XmlError};

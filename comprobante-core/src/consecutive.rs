//! Consecutive numbering.
//!
//! A consecutive number is the 20-digit `branch(3) + terminal(5) + type(2) + sequence(10)` string
//! embedded in every clave. Sequences come from a durable [`CounterStore`] supplied by the caller;
//! [`ConsecutiveAllocator`] serializes issuance per partition and refuses anything that would
//! reuse or move a sequence backwards.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use comprobante_derive::Validate;
use thiserror::Error;
use tracing::{debug, warn};

use crate::document::xml::constants::HACIENDA_SCHEMA_BASE;

/// Largest sequence that fits the 10-digit field.
pub const MAX_SEQUENCE: u64 = 9_999_999_999;

/// Electronic document types of the v4.4 schema set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentType {
    FacturaElectronica,
    NotaDebito,
    NotaCredito,
    Tiquete,
    FacturaExportacion,
    FacturaCompra,
    ReciboPago,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown document type code: {code}")]
pub struct UnknownDocumentType {
    pub code: String,
}

impl DocumentType {
    pub const ALL: [DocumentType; 7] = [
        DocumentType::FacturaElectronica,
        DocumentType::NotaDebito,
        DocumentType::NotaCredito,
        DocumentType::Tiquete,
        DocumentType::FacturaExportacion,
        DocumentType::FacturaCompra,
        DocumentType::ReciboPago,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            DocumentType::FacturaElectronica => "01",
            DocumentType::NotaDebito => "02",
            DocumentType::NotaCredito => "03",
            DocumentType::Tiquete => "04",
            DocumentType::FacturaExportacion => "05",
            DocumentType::FacturaCompra => "06",
            DocumentType::ReciboPago => "07",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, UnknownDocumentType> {
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or_else(|| UnknownDocumentType {
                code: code.to_owned(),
            })
    }

    /// Root element name of the document.
    pub fn root_element(&self) -> &'static str {
        match self {
            DocumentType::FacturaElectronica => "FacturaElectronica",
            DocumentType::NotaDebito => "NotaDebitoElectronica",
            DocumentType::NotaCredito => "NotaCreditoElectronica",
            DocumentType::Tiquete => "TiqueteElectronico",
            DocumentType::FacturaExportacion => "FacturaElectronicaExportacion",
            DocumentType::FacturaCompra => "FacturaElectronicaCompra",
            DocumentType::ReciboPago => "ReciboElectronicoPago",
        }
    }

    /// Target namespace of the v4.4 schema for this type.
    pub fn namespace(&self) -> String {
        let root = self.root_element();
        let mut chars = root.chars();
        let camel: String = match chars.next() {
            Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
            None => String::new(),
        };
        format!("{HACIENDA_SCHEMA_BASE}{camel}")
    }

    /// Schema file name, relative to the schema directory.
    pub fn schema_file(&self) -> String {
        format!("{}_V4.4.xsd", self.root_element())
    }

    /// Type whose v4.4 namespace is `uri`.
    pub fn from_namespace(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.namespace() == uri)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DocumentType {
    type Err = UnknownDocumentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code(s.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid partition: {0}")]
pub struct PartitionError(pub String);

impl From<String> for PartitionError {
    fn from(message: String) -> Self {
        PartitionError(message)
    }
}

/// Scope of consecutive-number uniqueness.
///
/// Built with the derived `Partition::new(tenant, branch_office, terminal, document_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Validate)]
#[validate_error(PartitionError)]
pub struct Partition {
    #[validate(non_empty)]
    tenant: String,
    #[validate(digits, len = 3)]
    branch_office: String,
    #[validate(digits, len = 5)]
    terminal: String,
    #[validate(skip)]
    document_type: DocumentType,
}

impl Partition {
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn branch_office(&self) -> &str {
        &self.branch_office
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant, self.branch_office, self.terminal, self.document_type
        )
    }
}

/// The 20-digit consecutive number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsecutiveNumber {
    branch_office: String,
    terminal: String,
    document_type: DocumentType,
    sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid consecutive number '{input}': {reason}")]
pub struct ParseConsecutiveError {
    pub input: String,
    pub reason: &'static str,
}

impl ConsecutiveNumber {
    /// Number for `sequence` within `partition`; `sequence` must be in `1..=MAX_SEQUENCE`.
    pub fn for_partition(partition: &Partition, sequence: u64) -> Option<Self> {
        (1..=MAX_SEQUENCE).contains(&sequence).then(|| Self {
            branch_office: partition.branch_office.clone(),
            terminal: partition.terminal.clone(),
            document_type: partition.document_type,
            sequence,
        })
    }

    pub fn branch_office(&self) -> &str {
        &self.branch_office
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for ConsecutiveNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{:010}",
            self.branch_office, self.terminal, self.document_type, self.sequence
        )
    }
}

impl FromStr for ConsecutiveNumber {
    type Err = ParseConsecutiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| ParseConsecutiveError {
            input: s.to_owned(),
            reason,
        };
        if s.len() != 20 {
            return Err(fail("expected 20 digits"));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(fail("only digits are allowed"));
        }
        let document_type =
            DocumentType::from_code(&s[8..10]).map_err(|_| fail("unknown document type"))?;
        let sequence: u64 = s[10..].parse().map_err(|_| fail("bad sequence"))?;
        if sequence == 0 {
            return Err(fail("sequence starts at 1"));
        }
        Ok(Self {
            branch_office: s[..3].to_owned(),
            terminal: s[3..8].to_owned(),
            document_type,
            sequence,
        })
    }
}

#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("counter backend unavailable: {0}")]
    Unavailable(String),
    #[error("counter backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter backend I/O error")]
    Io(#[from] std::io::Error),
}

/// Durable per-partition counter.
///
/// `next` atomically increments the counter for `partition` and returns the new value; the first
/// call for a partition returns 1. Each call must hand out a value exactly once, across processes.
pub trait CounterStore: Send + Sync {
    fn next(&self, partition: &Partition) -> Result<u64, CounterStoreError>;
}

impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    fn next(&self, partition: &Partition) -> Result<u64, CounterStoreError> {
        (**self).next(partition)
    }
}

impl<T: CounterStore + ?Sized> CounterStore for &T {
    fn next(&self, partition: &Partition) -> Result<u64, CounterStoreError> {
        (**self).next(partition)
    }
}

/// Process-local counter store for tests and single-process tools.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<Partition, u64>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the last issued value; the next call returns `last + 1`.
    pub fn with_last(self, partition: Partition, last: u64) -> Self {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition, last);
        self
    }

    pub fn last(&self, partition: &Partition) -> Option<u64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .copied()
    }
}

impl CounterStore for MemoryCounterStore {
    fn next(&self, partition: &Partition) -> Result<u64, CounterStoreError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| CounterStoreError::Unavailable("counter lock poisoned".into()))?;
        let counter = counters.entry(partition.clone()).or_insert(0);
        *counter = counter.saturating_add(1);
        Ok(*counter)
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("consecutive numbers exhausted for {partition} (backend returned {received})")]
    Exhausted { partition: String, received: u64 },
    #[error("counter backend unavailable for {partition}")]
    BackendUnavailable {
        partition: String,
        #[source]
        source: CounterStoreError,
    },
    #[error("counter backend returned {received} for {partition}, not above {previous}")]
    NonMonotonic {
        partition: String,
        previous: u64,
        received: u64,
    },
    #[error("counter backend returned 0 for {partition}")]
    InvalidSequence { partition: String },
}

impl AllocationError {
    /// Only a backend outage is worth retrying locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocationError::BackendUnavailable { .. })
    }
}

/// Issues consecutive numbers from a [`CounterStore`].
///
/// Calls for the same partition are serialized, so issuance order matches backend order.
/// A failed call leaves the recorded high-water mark untouched.
#[derive(Debug)]
pub struct ConsecutiveAllocator<S> {
    store: S,
    issued: Mutex<HashMap<Partition, Arc<Mutex<u64>>>>,
}

impl<S: CounterStore> ConsecutiveAllocator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn allocate(&self, partition: &Partition) -> Result<ConsecutiveNumber, AllocationError> {
        let slot = {
            let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(issued.entry(partition.clone()).or_default())
        };
        let mut last = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let received = self.store.next(partition).map_err(|source| {
            warn!(partition = %partition, error = %source, "counter backend failed");
            AllocationError::BackendUnavailable {
                partition: partition.to_string(),
                source,
            }
        })?;

        if received == 0 {
            return Err(AllocationError::InvalidSequence {
                partition: partition.to_string(),
            });
        }
        if received > MAX_SEQUENCE {
            return Err(AllocationError::Exhausted {
                partition: partition.to_string(),
                received,
            });
        }
        if received <= *last {
            return Err(AllocationError::NonMonotonic {
                partition: partition.to_string(),
                previous: *last,
                received,
            });
        }

        let number = ConsecutiveNumber::for_partition(partition, received).ok_or_else(|| {
            AllocationError::InvalidSequence {
                partition: partition.to_string(),
            }
        })?;
        *last = received;
        debug!(partition = %partition, sequence = received, consecutive = %number, "allocated");
        Ok(number)
    }
}

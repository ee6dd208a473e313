use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use comprobante_core::consecutive::{
    ConsecutiveAllocator, ConsecutiveNumber, DocumentType, MemoryCounterStore, Partition,
    MAX_SEQUENCE,
};
use proptest::prelude::*;

fn partition(terminal: &str, document_type: DocumentType) -> Partition {
    Partition::new("tenant-a".into(), "001".into(), terminal.into(), document_type)
        .expect("partition")
}

#[test]
fn concurrent_allocations_are_distinct_and_increasing() {
    let allocator = Arc::new(ConsecutiveAllocator::new(MemoryCounterStore::new()));
    let target = partition("00001", DocumentType::FacturaElectronica);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            let target = target.clone();
            thread::spawn(move || {
                (0..50)
                    .map(|_| allocator.allocate(&target).expect("allocate").sequence())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        let sequences = handle.join().expect("thread");
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
        all.extend(sequences);
    }
    let distinct: HashSet<_> = all.iter().copied().collect();
    assert_eq!(distinct.len(), 400);
    all.sort_unstable();
    assert_eq!(all, (1..=400).collect::<Vec<_>>());
}

#[test]
fn partitions_do_not_share_counters() {
    let allocator = ConsecutiveAllocator::new(MemoryCounterStore::new());
    let factura = partition("00001", DocumentType::FacturaElectronica);
    let nota = partition("00001", DocumentType::NotaCredito);
    let other_terminal = partition("00002", DocumentType::FacturaElectronica);

    assert_eq!(allocator.allocate(&factura).unwrap().sequence(), 1);
    assert_eq!(allocator.allocate(&factura).unwrap().sequence(), 2);
    assert_eq!(allocator.allocate(&nota).unwrap().to_string(), "00100001030000000001");
    assert_eq!(
        allocator.allocate(&other_terminal).unwrap().to_string(),
        "00100002010000000001"
    );
}

#[test]
fn exhaustion_never_wraps() {
    let target = partition("00001", DocumentType::Tiquete);
    let store = MemoryCounterStore::new().with_last(target.clone(), MAX_SEQUENCE - 1);
    let allocator = ConsecutiveAllocator::new(store);

    assert_eq!(allocator.allocate(&target).unwrap().sequence(), MAX_SEQUENCE);
    let err = allocator.allocate(&target).unwrap_err();
    assert!(err.to_string().contains("exhausted"));
    assert!(!err.is_retryable());
}

proptest! {
    #[test]
    fn display_parse_is_stable(sequence in 1u64..=MAX_SEQUENCE, code in 0usize..7) {
        let document_type = DocumentType::ALL[code];
        let target = partition("00042", document_type);
        let number = ConsecutiveNumber::for_partition(&target, sequence).unwrap();
        let text = number.to_string();
        prop_assert_eq!(text.len(), 20);
        prop_assert_eq!(&text[8..10], document_type.code());
        let parsed: ConsecutiveNumber = text.parse().unwrap();
        prop_assert_eq!(parsed, number);
    }
}

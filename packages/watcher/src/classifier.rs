//! Event Classifier
//!
//! Turns a raw log entry into a typed owner change. Owner events are matched by
//! topic, `SafeMultiSigTransaction` logs are unwrapped to their inner call data,
//! and anything else is treated as call data led by a function selector.

use std::fmt;
use std::sync::Arc;

use alloy::primitives::Address;
use tracing::warn;

use crate::decoder::{checksum, decode, extract_selector, DecodeError, DecodedRecord};
use crate::feed::RawLogEntry;
use crate::selector::{default_table, ChangeKind, SchemaEntry, SelectorKind, SelectorTable};

/// Classified owner change
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeEvent {
    OwnerAdded { owner: Address },
    OwnerRemoved { owner: Address },
    OwnerSwapped { old_owner: Address, new_owner: Address },
    /// No registered selector matched; produces no notification
    Unrecognized { selector_hex: String },
}

impl ChangeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeEvent::OwnerAdded { .. } => ChangeKind::OwnerAdded.name(),
            ChangeEvent::OwnerRemoved { .. } => ChangeKind::OwnerRemoved.name(),
            ChangeEvent::OwnerSwapped { .. } => ChangeKind::OwnerSwapped.name(),
            ChangeEvent::Unrecognized { .. } => "unrecognized",
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, ChangeEvent::Unrecognized { .. })
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeEvent::OwnerAdded { owner } | ChangeEvent::OwnerRemoved { owner } => {
                write!(f, "{} {}", self.name(), checksum(owner))
            }
            ChangeEvent::OwnerSwapped {
                old_owner,
                new_owner,
            } => write!(
                f,
                "{} {} -> {}",
                self.name(),
                checksum(old_owner),
                checksum(new_owner)
            ),
            ChangeEvent::Unrecognized { selector_hex } => {
                write!(f, "{} {}", self.name(), selector_hex)
            }
        }
    }
}

/// Classifier over a shared, read-only selector table
#[derive(Debug, Clone)]
pub struct EventClassifier {
    table: Arc<SelectorTable>,
}

impl EventClassifier {
    pub fn new(table: Arc<SelectorTable>) -> Self {
        Self { table }
    }

    /// Classifier over the built-in Safe owner-management table
    pub fn with_default_table() -> Self {
        Self::new(Arc::new(default_table().clone()))
    }

    pub fn table(&self) -> &SelectorTable {
        &self.table
    }

    /// Classify an entry; never fails
    ///
    /// A malformed body for a known selector is logged and reported as
    /// `Unrecognized`, so it never yields a notification.
    pub fn classify(&self, entry: &RawLogEntry) -> ChangeEvent {
        match self.try_classify(entry) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    tx = ?entry.transaction_hash,
                    block = ?entry.block_number,
                    error = %e,
                    "Malformed log entry"
                );
                ChangeEvent::Unrecognized {
                    selector_hex: leading_selector_hex(entry),
                }
            }
        }
    }

    /// Classify an entry, surfacing malformed payloads as errors
    ///
    /// Entries without topics are read as selector-prefixed payloads; an entry
    /// whose `topics[0]` matches nothing is `Unrecognized`.
    pub fn try_classify(&self, entry: &RawLogEntry) -> Result<ChangeEvent, DecodeError> {
        let Some(topic) = entry.topics.first() else {
            return self.classify_calldata(&entry.data);
        };

        match self.table.lookup_topic(topic) {
            Some(schema_entry) if schema_entry.kind == SelectorKind::AggregateEvent => {
                let record = decode(&entry.data, &schema_entry.schema)?;
                self.classify_calldata(record.require_bytes("data")?)
            }
            Some(schema_entry) => self.classify_owner_event(schema_entry, entry),
            None => Ok(ChangeEvent::Unrecognized {
                selector_hex: leading_selector_hex(entry),
            }),
        }
    }

    /// Classify a payload led by a 4-byte selector
    ///
    /// Function selectors and owner-event selectors both match; the bytes after
    /// the selector are decoded with that entry's schema.
    pub fn classify_calldata(&self, calldata: &[u8]) -> Result<ChangeEvent, DecodeError> {
        let Some(selector) = extract_selector(calldata) else {
            return Ok(ChangeEvent::Unrecognized {
                selector_hex: format!("0x{}", hex::encode(calldata)),
            });
        };

        match self.table.lookup_prefix(&selector) {
            Some(schema_entry) => {
                let record = decode(&calldata[4..], &schema_entry.schema)?;
                change_from_record(schema_entry, &record)
            }
            None => Ok(ChangeEvent::Unrecognized {
                selector_hex: selector.to_hex(),
            }),
        }
    }

    fn classify_owner_event(
        &self,
        schema_entry: &SchemaEntry,
        entry: &RawLogEntry,
    ) -> Result<ChangeEvent, DecodeError> {
        // Safe 1.4 indexes the owner, leaving `data` empty
        if entry.data.is_empty() && entry.topics.len() > 1 {
            let body: Vec<u8> = entry.topics[1..]
                .iter()
                .flat_map(|topic| topic.as_slice().iter().copied())
                .collect();
            let record = decode(&body, &schema_entry.schema)?;
            return change_from_record(schema_entry, &record);
        }

        let record = decode(&entry.data, &schema_entry.schema)?;
        change_from_record(schema_entry, &record)
    }
}

impl Default for EventClassifier {
    fn default() -> Self {
        Self::with_default_table()
    }
}

fn change_from_record(
    schema_entry: &SchemaEntry,
    record: &DecodedRecord,
) -> Result<ChangeEvent, DecodeError> {
    match schema_entry.change {
        ChangeKind::OwnerAdded => Ok(ChangeEvent::OwnerAdded {
            owner: record.require_address("owner")?,
        }),
        ChangeKind::OwnerRemoved => Ok(ChangeEvent::OwnerRemoved {
            owner: record.require_address("owner")?,
        }),
        ChangeKind::OwnerSwapped => Ok(ChangeEvent::OwnerSwapped {
            old_owner: record.require_address("oldOwner")?,
            new_owner: record.require_address("newOwner")?,
        }),
        ChangeKind::MultiSigTransaction => Ok(ChangeEvent::Unrecognized {
            selector_hex: schema_entry.selector.to_hex(),
        }),
    }
}

fn leading_selector_hex(entry: &RawLogEntry) -> String {
    let source = match entry.topics.first() {
        Some(topic) => topic.as_slice(),
        None => entry.data.as_ref(),
    };
    format!("0x{}", hex::encode(&source[..source.len().min(4)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::encode_address_slot;
    use crate::selector::{topic_hash, Selector};
    use alloy::primitives::{address, Bytes, B256, U256};
    use alloy::sol_types::SolValue;

    const SAFE_TX: &str = "SafeMultiSigTransaction(address,uint256,bytes,uint8,uint256,uint256,uint256,address,address,bytes,bytes)";

    fn calldata(signature: &str, params: Vec<u8>) -> Vec<u8> {
        let mut data = Selector::from_signature(signature).as_bytes().to_vec();
        data.extend(params);
        data
    }

    fn multisig_entry(inner: Vec<u8>) -> RawLogEntry {
        let safe = address!("D1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb");
        let data = (
            safe,
            U256::ZERO,
            Bytes::from(inner),
            0u16,
            U256::ZERO,
            U256::ZERO,
            U256::ZERO,
            Address::ZERO,
            Address::ZERO,
            Bytes::from(vec![0xaa; 65]),
            Bytes::from(vec![0xbb; 96]),
        )
            .abi_encode_params();
        RawLogEntry::new(vec![topic_hash(SAFE_TX)], data)
    }

    #[test]
    fn test_added_owner_event() {
        let body = hex::decode("0000000000000000000000000000000000000000000000000000000000000042").unwrap();
        let entry = RawLogEntry::new(vec![topic_hash("AddedOwner(address)")], body);

        let event = EventClassifier::default().classify(&entry);

        assert_eq!(
            event,
            ChangeEvent::OwnerAdded {
                owner: address!("0000000000000000000000000000000000000042")
            }
        );
        assert_eq!(event.to_string(), "owner-added 0x0000000000000000000000000000000000000042");
    }

    #[test]
    fn test_removed_owner_event() {
        let owner = address!("fB6916095ca1df60bB79Ce92cE3Ea74c37c5d359");
        let entry = RawLogEntry::new(
            vec![topic_hash("RemovedOwner(address)")],
            encode_address_slot(&owner).to_vec(),
        );
        assert_eq!(
            EventClassifier::default().classify(&entry),
            ChangeEvent::OwnerRemoved { owner }
        );
    }

    #[test]
    fn test_indexed_owner_event_reads_topic() {
        let owner = address!("dbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB");
        let entry = RawLogEntry::new(
            vec![
                topic_hash("AddedOwner(address)"),
                B256::from(encode_address_slot(&owner)),
            ],
            Vec::new(),
        );
        assert_eq!(
            EventClassifier::default().classify(&entry),
            ChangeEvent::OwnerAdded { owner }
        );
    }

    #[test]
    fn test_swap_owner_calldata() {
        let prev = Address::repeat_byte(0x01);
        let old = Address::repeat_byte(0x02);
        let new = Address::repeat_byte(0x03);
        let data = calldata(
            "swapOwner(address,address,address)",
            (prev, old, new).abi_encode_params(),
        );

        let event = EventClassifier::default()
            .classify_calldata(&data)
            .unwrap();

        assert_eq!(
            event,
            ChangeEvent::OwnerSwapped {
                old_owner: old,
                new_owner: new
            }
        );
    }

    #[test]
    fn test_swap_owner_inside_multisig_transaction() {
        let old = address!("5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed");
        let new = address!("fB6916095ca1df60bB79Ce92cE3Ea74c37c5d359");
        let inner = calldata(
            "swapOwner(address,address,address)",
            (Address::repeat_byte(0x01), old, new).abi_encode_params(),
        );

        let event = EventClassifier::default().classify(&multisig_entry(inner));

        assert_eq!(
            event,
            ChangeEvent::OwnerSwapped {
                old_owner: old,
                new_owner: new
            }
        );
    }

    #[test]
    fn test_add_owner_with_threshold_inside_multisig_transaction() {
        let owner = address!("D1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb");
        let inner = calldata(
            "addOwnerWithThreshold(address,uint256)",
            (owner, U256::from(2u64)).abi_encode_params(),
        );
        assert_eq!(
            EventClassifier::default().classify(&multisig_entry(inner)),
            ChangeEvent::OwnerAdded { owner }
        );
    }

    #[test]
    fn test_remove_owner_reads_second_slot() {
        let owner = address!("dbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB");
        let inner = calldata(
            "removeOwner(address,address,uint256)",
            (Address::repeat_byte(0x01), owner, U256::from(1u64)).abi_encode_params(),
        );
        assert_eq!(
            EventClassifier::default().classify(&multisig_entry(inner)),
            ChangeEvent::OwnerRemoved { owner }
        );
    }

    #[test]
    fn test_multisig_transaction_with_other_call_is_unrecognized() {
        // ERC20 transfer executed through the Safe
        let inner = calldata(
            "transfer(address,uint256)",
            (Address::repeat_byte(0x09), U256::from(5u64)).abi_encode_params(),
        );
        assert_eq!(
            EventClassifier::default().classify(&multisig_entry(inner)),
            ChangeEvent::Unrecognized {
                selector_hex: "0xa9059cbb".to_string()
            }
        );
    }

    #[test]
    fn test_multisig_transaction_with_empty_calldata_is_unrecognized() {
        let event = EventClassifier::default().classify(&multisig_entry(Vec::new()));
        assert_eq!(
            event,
            ChangeEvent::Unrecognized {
                selector_hex: "0x".to_string()
            }
        );
    }

    #[test]
    fn test_short_payload_is_unrecognized() {
        let classifier = EventClassifier::default();
        for len in 0..4 {
            let entry = RawLogEntry::new(Vec::new(), vec![0xe3; len]);
            let event = classifier.classify(&entry);
            assert!(!event.is_recognized(), "length {len}");
            assert!(classifier.try_classify(&entry).is_ok());
        }
    }

    #[test]
    fn test_unknown_topic_is_unrecognized() {
        let mut unknown = B256::ZERO;
        unknown[0] = 0x12;
        // A foreign event whose body happens to start like swapOwner call data
        let body = calldata(
            "swapOwner(address,address,address)",
            (Address::repeat_byte(1), Address::repeat_byte(2), Address::repeat_byte(3))
                .abi_encode_params(),
        );
        let entry = RawLogEntry::new(vec![unknown], body);
        let classifier = EventClassifier::default();

        assert_eq!(
            classifier.try_classify(&entry).unwrap(),
            ChangeEvent::Unrecognized {
                selector_hex: "0x12000000".to_string()
            }
        );
    }

    #[test]
    fn test_event_selector_prefix_payload() {
        let mut payload = Selector::from_signature("AddedOwner(address)").as_bytes().to_vec();
        payload.extend(hex::decode("0000000000000000000000000000000000000000000000000000000000000042").unwrap());
        let entry = RawLogEntry::new(Vec::new(), payload);

        assert_eq!(
            EventClassifier::default().classify(&entry),
            ChangeEvent::OwnerAdded {
                owner: address!("0000000000000000000000000000000000000042")
            }
        );
    }

    #[test]
    fn test_removed_owner_selector_prefix_payload() {
        let owner = Address::repeat_byte(0x77);
        let entry = RawLogEntry::new(Vec::new(), calldata("RemovedOwner(address)", encode_address_slot(&owner).to_vec()));
        assert_eq!(
            EventClassifier::default().classify(&entry),
            ChangeEvent::OwnerRemoved { owner }
        );
    }

    #[test]
    fn test_aggregate_selector_prefix_is_unrecognized() {
        let entry = RawLogEntry::new(Vec::new(), calldata(SAFE_TX, vec![0u8; 32 * 11]));
        assert!(!EventClassifier::default().classify(&entry).is_recognized());
    }

    #[test]
    fn test_truncated_known_calldata_is_malformed() {
        let data = calldata(
            "swapOwner(address,address,address)",
            vec![0u8; 64], // one slot short
        );
        let entry = RawLogEntry::new(Vec::new(), data);
        let classifier = EventClassifier::default();

        assert!(matches!(
            classifier.try_classify(&entry),
            Err(DecodeError::TooShort { expected: 96, actual: 64 })
        ));
        assert_eq!(
            classifier.classify(&entry),
            ChangeEvent::Unrecognized {
                selector_hex: "0xe318b52b".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_event_body_is_unrecognized() {
        let mut body = [0u8; 32];
        body[0] = 0xff;
        let entry = RawLogEntry::new(vec![topic_hash("AddedOwner(address)")], body.to_vec());
        let classifier = EventClassifier::default();

        assert!(matches!(
            classifier.try_classify(&entry),
            Err(DecodeError::NonZeroPadding { .. })
        ));
        assert!(!classifier.classify(&entry).is_recognized());
    }

    #[test]
    fn test_classification_is_idempotent() {
        let inner = calldata(
            "swapOwner(address,address,address)",
            (Address::repeat_byte(1), Address::repeat_byte(2), Address::repeat_byte(3))
                .abi_encode_params(),
        );
        let entries = [
            multisig_entry(inner),
            RawLogEntry::new(Vec::new(), vec![0x01]),
            RawLogEntry::new(vec![topic_hash("AddedOwner(address)")], vec![0xff; 32]),
        ];
        let classifier = EventClassifier::default();

        for entry in &entries {
            assert_eq!(classifier.classify(entry), classifier.classify(entry));
        }
    }

    #[test]
    fn test_change_event_display_uses_checksum() {
        let event = ChangeEvent::OwnerSwapped {
            old_owner: address!("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"),
            new_owner: address!("fb6916095ca1df60bb79ce92ce3ea74c37c5d359"),
        };
        assert_eq!(
            event.to_string(),
            "owner-swapped 0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed -> 0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359"
        );
    }
}

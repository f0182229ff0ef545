//! ABI Payload Decoder
//!
//! Decodes ABI-encoded event bodies and call data against a declared field schema.
//! Every slot is 32 bytes; dynamic `bytes` fields are offset-addressed and
//! length-prefixed. Decoding is pure: same bytes and schema, same record.

use alloy::primitives::{Address, Bytes, U256};
use thiserror::Error;

use crate::selector::Selector;

/// Width of one ABI slot
pub const WORD: usize = 32;

/// Errors that can occur during payload decoding
///
/// Every variant describes a malformed payload; none of them is fatal to the
/// pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed payload: {actual} bytes is shorter than the {expected}-byte head")]
    TooShort { expected: usize, actual: usize },

    #[error("Malformed payload: dynamic field '{field}' points outside the {payload_len}-byte payload")]
    DynamicOutOfBounds { field: String, payload_len: usize },

    #[error("Malformed payload: non-zero padding in field '{field}'")]
    NonZeroPadding { field: String },

    #[error("Malformed payload: field '{field}' holds {value}, not a boolean")]
    InvalidBool { field: String, value: u8 },

    #[error("Malformed payload: decoded record has no {expected} field '{field}'")]
    MissingField { field: String, expected: &'static str },
}

/// Primitive ABI types the decoder understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 20 bytes, left-padded with zeros
    Address,
    /// 32-byte big-endian integer
    Uint256,
    /// Enum value; one byte right-aligned in its slot
    Uint8,
    /// 0 or 1, right-aligned in its slot
    Bool,
    /// Dynamic byte string
    Bytes,
}

impl FieldType {
    /// Map a canonical ABI type name to a field type
    pub fn from_abi_name(name: &str) -> Option<Self> {
        match name {
            "address" => Some(FieldType::Address),
            "uint256" | "uint" => Some(FieldType::Uint256),
            "uint8" => Some(FieldType::Uint8),
            "bool" => Some(FieldType::Bool),
            "bytes" => Some(FieldType::Bytes),
            _ => None,
        }
    }

    pub fn abi_name(&self) -> &'static str {
        match self {
            FieldType::Address => "address",
            FieldType::Uint256 => "uint256",
            FieldType::Uint8 => "uint8",
            FieldType::Bool => "bool",
            FieldType::Bytes => "bytes",
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, FieldType::Bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
}

/// Ordered (name, type) pairs describing a payload body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldSchema {
    fields: Vec<Field>,
}

impl FieldSchema {
    pub fn new<N: Into<String>>(fields: impl IntoIterator<Item = (N, FieldType)>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|(name, ty)| Field {
                    name: name.into(),
                    ty,
                })
                .collect(),
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Static head size; any valid payload is at least this long
    pub fn min_len(&self) -> usize {
        self.fields.len() * WORD
    }
}

/// A single decoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    Address(Address),
    Uint(U256),
    Uint8(u8),
    Bool(bool),
    Bytes(Bytes),
}

/// Field name → decoded value, in schema order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedRecord {
    values: Vec<(String, DecodedValue)>,
}

impl DecodedRecord {
    pub fn get(&self, name: &str) -> Option<&DecodedValue> {
        self.values
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn address(&self, name: &str) -> Option<Address> {
        match self.get(name)? {
            DecodedValue::Address(address) => Some(*address),
            _ => None,
        }
    }

    pub fn uint(&self, name: &str) -> Option<U256> {
        match self.get(name)? {
            DecodedValue::Uint(value) => Some(*value),
            _ => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&Bytes> {
        match self.get(name)? {
            DecodedValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Typed address lookup that reports a missing field as malformed
    pub fn require_address(&self, name: &str) -> Result<Address, DecodeError> {
        self.address(name).ok_or_else(|| DecodeError::MissingField {
            field: name.to_string(),
            expected: "address",
        })
    }

    /// Typed bytes lookup that reports a missing field as malformed
    pub fn require_bytes(&self, name: &str) -> Result<&Bytes, DecodeError> {
        self.bytes(name).ok_or_else(|| DecodeError::MissingField {
            field: name.to_string(),
            expected: "bytes",
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DecodedValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Decode `payload` against `schema`
///
/// # Arguments
/// * `payload` - ABI-encoded body (event data, or call data after the selector)
/// * `schema` - Field layout of the body
///
/// # Returns
/// A complete `DecodedRecord`, or the first malformation found. Never a partial record.
pub fn decode(payload: &[u8], schema: &FieldSchema) -> Result<DecodedRecord, DecodeError> {
    let head = schema.min_len();
    if payload.len() < head {
        return Err(DecodeError::TooShort {
            expected: head,
            actual: payload.len(),
        });
    }

    let mut values = Vec::with_capacity(schema.len());
    for (index, field) in schema.fields().iter().enumerate() {
        let slot = &payload[index * WORD..(index + 1) * WORD];
        let value = match field.ty {
            FieldType::Address => DecodedValue::Address(decode_address(slot, &field.name)?),
            FieldType::Uint256 => DecodedValue::Uint(U256::from_be_slice(slot)),
            FieldType::Uint8 => DecodedValue::Uint8(decode_small(slot, &field.name)?),
            FieldType::Bool => match decode_small(slot, &field.name)? {
                0 => DecodedValue::Bool(false),
                1 => DecodedValue::Bool(true),
                value => {
                    return Err(DecodeError::InvalidBool {
                        field: field.name.clone(),
                        value,
                    })
                }
            },
            FieldType::Bytes => DecodedValue::Bytes(decode_dynamic(payload, slot, &field.name)?),
        };
        values.push((field.name.clone(), value));
    }

    Ok(DecodedRecord { values })
}

/// Low 20 bytes of a slot; the 12 padding bytes must be zero
fn decode_address(slot: &[u8], field: &str) -> Result<Address, DecodeError> {
    if slot[..WORD - 20].iter().any(|&b| b != 0) {
        return Err(DecodeError::NonZeroPadding {
            field: field.to_string(),
        });
    }
    Ok(Address::from_slice(&slot[WORD - 20..]))
}

fn decode_small(slot: &[u8], field: &str) -> Result<u8, DecodeError> {
    if slot[..WORD - 1].iter().any(|&b| b != 0) {
        return Err(DecodeError::NonZeroPadding {
            field: field.to_string(),
        });
    }
    Ok(slot[WORD - 1])
}

fn decode_dynamic(payload: &[u8], slot: &[u8], field: &str) -> Result<Bytes, DecodeError> {
    let out_of_bounds = || DecodeError::DynamicOutOfBounds {
        field: field.to_string(),
        payload_len: payload.len(),
    };

    let offset = read_usize(slot).ok_or_else(out_of_bounds)?;
    let length_end = offset.checked_add(WORD).ok_or_else(out_of_bounds)?;
    let length_slot = payload.get(offset..length_end).ok_or_else(out_of_bounds)?;
    let length = read_usize(length_slot).ok_or_else(out_of_bounds)?;
    let data_end = length_end.checked_add(length).ok_or_else(out_of_bounds)?;
    let data = payload.get(length_end..data_end).ok_or_else(out_of_bounds)?;

    Ok(Bytes::copy_from_slice(data))
}

/// Read a 32-byte big-endian slot as usize, if it fits
fn read_usize(slot: &[u8]) -> Option<usize> {
    if slot.len() != WORD || slot[..WORD - 8].iter().any(|&b| b != 0) {
        return None;
    }
    let low: [u8; 8] = slot[WORD - 8..].try_into().ok()?;
    usize::try_from(u64::from_be_bytes(low)).ok()
}

/// Left-pad an address into a 32-byte slot
pub fn encode_address_slot(address: &Address) -> [u8; WORD] {
    let mut slot = [0u8; WORD];
    slot[WORD - 20..].copy_from_slice(address.as_slice());
    slot
}

/// EIP-55 mixed-case rendering of an address
pub fn checksum(address: &Address) -> String {
    address.to_checksum(None)
}

/// Extract the leading function selector from call data
///
/// # Returns
/// `Some(Selector)` if input has at least 4 bytes, `None` otherwise
pub fn extract_selector(input: &[u8]) -> Option<Selector> {
    Selector::from_slice(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use alloy::sol_types::SolValue;

    fn owner_schema() -> FieldSchema {
        FieldSchema::new([("owner", FieldType::Address)])
    }

    fn mixed_schema() -> FieldSchema {
        FieldSchema::new([
            ("to", FieldType::Address),
            ("value", FieldType::Uint256),
            ("data", FieldType::Bytes),
            ("operation", FieldType::Uint8),
            ("flag", FieldType::Bool),
        ])
    }

    fn mixed_payload() -> Vec<u8> {
        (
            address!("5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"),
            U256::from(1_000_000u64),
            Bytes::from(vec![0xe3, 0x18, 0xb5, 0x2b, 0x01, 0x02]),
            1u16,
            true,
        )
            .abi_encode_params()
    }

    // ==================== Static field tests ====================

    #[test]
    fn test_decode_single_address() {
        let owner = address!("fB6916095ca1df60bB79Ce92cE3Ea74c37c5d359");
        let record = decode(&encode_address_slot(&owner), &owner_schema()).unwrap();
        assert_eq!(record.address("owner"), Some(owner));
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_decode_matches_reference_encoding() {
        let record = decode(&mixed_payload(), &mixed_schema()).unwrap();

        assert_eq!(
            record.address("to"),
            Some(address!("5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"))
        );
        assert_eq!(record.uint("value"), Some(U256::from(1_000_000u64)));
        assert_eq!(
            record.bytes("data").unwrap().as_ref(),
            &[0xe3, 0x18, 0xb5, 0x2b, 0x01, 0x02]
        );
        assert_eq!(record.get("operation"), Some(&DecodedValue::Uint8(1)));
        assert_eq!(record.get("flag"), Some(&DecodedValue::Bool(true)));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let payload = mixed_payload();
        let schema = mixed_schema();
        let first = decode(&payload, &schema).unwrap();
        let _ = decode(&encode_address_slot(&Address::ZERO), &owner_schema());
        let second = decode(&payload, &schema).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_preserves_schema_order() {
        let record = decode(&mixed_payload(), &mixed_schema()).unwrap();
        let names: Vec<&str> = record.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["to", "value", "data", "operation", "flag"]);
    }

    #[test]
    fn test_decode_empty_schema_accepts_empty_payload() {
        let record = decode(&[], &FieldSchema::default()).unwrap();
        assert!(record.is_empty());
    }

    // ==================== Length tests ====================

    #[test]
    fn test_decode_every_short_length_fails() {
        let schema = mixed_schema();
        let payload = mixed_payload();
        for len in 0..schema.min_len() {
            let result = decode(&payload[..len], &schema);
            assert_eq!(
                result,
                Err(DecodeError::TooShort {
                    expected: schema.min_len(),
                    actual: len
                }),
                "length {len} should be rejected"
            );
        }
    }

    #[test]
    fn test_min_len_is_head_size() {
        assert_eq!(owner_schema().min_len(), 32);
        assert_eq!(mixed_schema().min_len(), 160);
    }

    // ==================== Padding tests ====================

    #[test]
    fn test_decode_rejects_dirty_address_padding() {
        let mut slot = encode_address_slot(&address!("dbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB"));
        slot[0] = 0x01;
        let result = decode(&slot, &owner_schema());
        assert!(matches!(result, Err(DecodeError::NonZeroPadding { field }) if field == "owner"));
    }

    #[test]
    fn test_decode_rejects_dirty_uint8_padding() {
        let schema = FieldSchema::new([("operation", FieldType::Uint8)]);
        let mut slot = [0u8; 32];
        slot[30] = 0x01;
        slot[31] = 0x01;
        assert!(matches!(
            decode(&slot, &schema),
            Err(DecodeError::NonZeroPadding { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_non_boolean() {
        let schema = FieldSchema::new([("flag", FieldType::Bool)]);
        let mut slot = [0u8; 32];
        slot[31] = 2;
        assert_eq!(
            decode(&slot, &schema),
            Err(DecodeError::InvalidBool {
                field: "flag".to_string(),
                value: 2
            })
        );
    }

    // ==================== Dynamic bytes tests ====================

    #[test]
    fn test_decode_empty_dynamic_bytes() {
        let payload = (Bytes::new(),).abi_encode_params();
        let schema = FieldSchema::new([("data", FieldType::Bytes)]);
        let record = decode(&payload, &schema).unwrap();
        assert!(record.bytes("data").unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_offset_past_end() {
        let schema = FieldSchema::new([("data", FieldType::Bytes)]);
        let mut payload = [0u8; 64];
        payload[31] = 0x40; // offset 64, no room for a length slot
        assert!(matches!(
            decode(&payload, &schema),
            Err(DecodeError::DynamicOutOfBounds { payload_len: 64, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_length_past_end() {
        let schema = FieldSchema::new([("data", FieldType::Bytes)]);
        let mut payload = [0u8; 96];
        payload[31] = 0x20; // offset 32
        payload[63] = 0x40; // claims 64 bytes, only 32 follow
        assert!(matches!(
            decode(&payload, &schema),
            Err(DecodeError::DynamicOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_huge_offset() {
        let schema = FieldSchema::new([("data", FieldType::Bytes)]);
        let payload = [0xffu8; 64];
        assert!(matches!(
            decode(&payload, &schema),
            Err(DecodeError::DynamicOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_overflowing_length() {
        let schema = FieldSchema::new([("data", FieldType::Bytes)]);
        let mut payload = [0u8; 64];
        payload[31] = 0x20;
        payload[56..64].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(
            decode(&payload, &schema),
            Err(DecodeError::DynamicOutOfBounds { .. })
        ));
    }

    // ==================== Address round-trip tests ====================

    #[test]
    fn test_address_slot_round_trip_is_checksummed() {
        let vectors = [
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
            "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
            "0x0000000000000000000000000000000000000042",
        ];

        for expected in vectors {
            let original: Address = expected.to_lowercase().parse().unwrap();
            let record = decode(&encode_address_slot(&original), &owner_schema()).unwrap();
            let decoded = record.address("owner").unwrap();
            assert_eq!(decoded, original);
            assert_eq!(checksum(&decoded), expected);
        }
    }

    #[test]
    fn test_address_slot_round_trip_across_byte_patterns() {
        for byte in [0x00u8, 0x01, 0x7f, 0x80, 0xab, 0xff] {
            let original = Address::repeat_byte(byte);
            let record = decode(&encode_address_slot(&original), &owner_schema()).unwrap();
            assert_eq!(record.address("owner"), Some(original));
        }
    }

    // ==================== Record accessor tests ====================

    #[test]
    fn test_record_typed_accessors_reject_wrong_type() {
        let record = decode(&mixed_payload(), &mixed_schema()).unwrap();
        assert_eq!(record.address("value"), None);
        assert_eq!(record.bytes("to"), None);
        assert_eq!(record.uint("missing"), None);
        assert!(matches!(
            record.require_address("data"),
            Err(DecodeError::MissingField { expected: "address", .. })
        ));
        assert!(record.require_bytes("data").is_ok());
    }

    // ==================== extract_selector tests ====================

    #[test]
    fn test_extract_selector_from_valid_input() {
        let input = vec![0xe3, 0x18, 0xb5, 0x2b, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            extract_selector(&input),
            Some(Selector::new([0xe3, 0x18, 0xb5, 0x2b]))
        );
    }

    #[test]
    fn test_extract_selector_from_short_input() {
        assert_eq!(extract_selector(&[]), None);
        assert_eq!(extract_selector(&[0xe3]), None);
        assert_eq!(extract_selector(&[0xe3, 0x18, 0xb5]), None);
    }

    #[test]
    fn test_field_type_names_round_trip() {
        for ty in [
            FieldType::Address,
            FieldType::Uint256,
            FieldType::Uint8,
            FieldType::Bool,
            FieldType::Bytes,
        ] {
            assert_eq!(FieldType::from_abi_name(ty.abi_name()), Some(ty));
        }
        assert_eq!(FieldType::from_abi_name("int256"), None);
        assert!(FieldType::Bytes.is_dynamic());
        assert!(!FieldType::Address.is_dynamic());
    }
}

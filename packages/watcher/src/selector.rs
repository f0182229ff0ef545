//! Selector Table
//!
//! Static registry mapping 4-byte selectors to a decoding schema and the kind of
//! owner change they describe. Targets Safe multi-signature wallets.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use alloy::primitives::{keccak256, B256};
use thiserror::Error;

use crate::decoder::{FieldSchema, FieldType};

/// Errors raised while building a selector table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Unsupported parameter type '{ty}' in {signature}")]
    UnsupportedType { signature: String, ty: String },

    #[error("{signature} declares {expected} parameters but {actual} names were given")]
    ParamCountMismatch {
        signature: String,
        expected: usize,
        actual: usize,
    },

    #[error("Selector collision on {selector}: {first} and {second}")]
    Collision {
        selector: Selector,
        first: String,
        second: String,
    },

    #[error("Invalid selector hex: {0}")]
    InvalidHex(String),
}

/// First 4 bytes of the keccak-256 hash of a canonical signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selector([u8; 4]);

impl Selector {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Hash a signature; whitespace is stripped first
    pub fn from_signature(signature: &str) -> Self {
        let hash = topic_hash(signature);
        Self([hash[0], hash[1], hash[2], hash[3]])
    }

    /// Read the leading 4 bytes of `bytes`, if there are that many
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let head: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(Self(head))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Lowercase hex with 0x prefix (e.g., "0xe318b52b")
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl From<[u8; 4]> for Selector {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Selector {
    type Err = TableError;

    /// Case-insensitive, with or without 0x prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(digits).map_err(|_| TableError::InvalidHex(s.to_string()))?;
        let bytes: [u8; 4] = bytes
            .try_into()
            .map_err(|_| TableError::InvalidHex(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Strip all whitespace from a signature before hashing
pub fn canonical_signature(signature: &str) -> String {
    signature.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Full 32-byte event topic for a signature
pub fn topic_hash(signature: &str) -> B256 {
    keccak256(canonical_signature(signature).as_bytes())
}

/// Where a selector shows up in the payloads we watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectorKind {
    /// Owner event; `topics[0]` is the signature hash
    Event,
    /// `SafeMultiSigTransaction`; its `data` field carries inner call data
    AggregateEvent,
    /// Function selector leading a block of call data
    Function,
}

/// Semantic tag attached to each selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    OwnerAdded,
    OwnerRemoved,
    OwnerSwapped,
    MultiSigTransaction,
}

impl ChangeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeKind::OwnerAdded => "owner-added",
            ChangeKind::OwnerRemoved => "owner-removed",
            ChangeKind::OwnerSwapped => "owner-swapped",
            ChangeKind::MultiSigTransaction => "multisig-transaction",
        }
    }
}

/// Raw table row: a signature plus the names of its parameters
#[derive(Debug, Clone, Copy)]
pub struct SelectorSpec {
    pub signature: &'static str,
    pub kind: SelectorKind,
    pub change: ChangeKind,
    pub params: &'static [&'static str],
}

/// Built-in rows for Safe owner management
pub const SAFE_OWNER_SPECS: &[SelectorSpec] = &[
    SelectorSpec {
        signature: "AddedOwner(address)",
        kind: SelectorKind::Event,
        change: ChangeKind::OwnerAdded,
        params: &["owner"],
    },
    SelectorSpec {
        signature: "RemovedOwner(address)",
        kind: SelectorKind::Event,
        change: ChangeKind::OwnerRemoved,
        params: &["owner"],
    },
    SelectorSpec {
        signature: "SafeMultiSigTransaction(address,uint256,bytes,uint8,uint256,uint256,uint256,address,address,bytes,bytes)",
        kind: SelectorKind::AggregateEvent,
        change: ChangeKind::MultiSigTransaction,
        params: &[
            "to",
            "value",
            "data",
            "operation",
            "safeTxGas",
            "baseGas",
            "gasPrice",
            "gasToken",
            "refundReceiver",
            "signatures",
            "additionalInfo",
        ],
    },
    SelectorSpec {
        signature: "addOwnerWithThreshold(address,uint256)",
        kind: SelectorKind::Function,
        change: ChangeKind::OwnerAdded,
        params: &["owner", "threshold"],
    },
    SelectorSpec {
        signature: "removeOwner(address,address,uint256)",
        kind: SelectorKind::Function,
        change: ChangeKind::OwnerRemoved,
        params: &["prevOwner", "owner", "threshold"],
    },
    SelectorSpec {
        signature: "swapOwner(address,address,address)",
        kind: SelectorKind::Function,
        change: ChangeKind::OwnerSwapped,
        params: &["prevOwner", "oldOwner", "newOwner"],
    },
];

/// A resolved table row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaEntry {
    /// Canonical (whitespace-free) signature
    pub signature: String,
    pub selector: Selector,
    /// Full signature hash, meaningful for event kinds
    pub topic: B256,
    pub kind: SelectorKind,
    pub change: ChangeKind,
    pub schema: FieldSchema,
}

impl SchemaEntry {
    fn from_spec(spec: &SelectorSpec) -> Result<Self, TableError> {
        let signature = canonical_signature(spec.signature);
        let types = parse_param_types(&signature)?;

        if types.len() != spec.params.len() {
            return Err(TableError::ParamCountMismatch {
                signature,
                expected: types.len(),
                actual: spec.params.len(),
            });
        }

        let topic = topic_hash(&signature);
        Ok(Self {
            selector: Selector::from_signature(&signature),
            topic,
            kind: spec.kind,
            change: spec.change,
            schema: FieldSchema::new(spec.params.iter().copied().zip(types)),
            signature,
        })
    }

    pub fn is_event(&self) -> bool {
        !matches!(self.kind, SelectorKind::Function)
    }
}

/// Parse the parameter list of a canonical signature into field types
fn parse_param_types(signature: &str) -> Result<Vec<FieldType>, TableError> {
    let malformed = || TableError::MalformedSignature(signature.to_string());

    let open = signature.find('(').ok_or_else(malformed)?;
    let inner = signature
        .get(open + 1..)
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(malformed)?;

    if open == 0 {
        return Err(malformed());
    }
    if inner.is_empty() {
        return Ok(Vec::new());
    }

    inner
        .split(',')
        .map(|ty| {
            FieldType::from_abi_name(ty).ok_or_else(|| TableError::UnsupportedType {
                signature: signature.to_string(),
                ty: ty.to_string(),
            })
        })
        .collect()
}

/// Immutable selector registry; safe to share across tasks without locking
#[derive(Debug, Clone)]
pub struct SelectorTable {
    entries: Vec<SchemaEntry>,
    by_selector: HashMap<Selector, usize>,
}

impl SelectorTable {
    /// Build a table from raw rows, rejecting collisions and bad signatures
    pub fn new<'a>(specs: impl IntoIterator<Item = &'a SelectorSpec>) -> Result<Self, TableError> {
        let mut entries: Vec<SchemaEntry> = Vec::new();
        let mut by_selector = HashMap::new();

        for spec in specs {
            let entry = SchemaEntry::from_spec(spec)?;
            if let Some(&existing) = by_selector.get(&entry.selector) {
                let first: &SchemaEntry = &entries[existing];
                return Err(TableError::Collision {
                    selector: entry.selector,
                    first: first.signature.clone(),
                    second: entry.signature,
                });
            }
            by_selector.insert(entry.selector, entries.len());
            entries.push(entry);
        }

        Ok(Self {
            entries,
            by_selector,
        })
    }

    /// The built-in Safe owner-management table
    pub fn safe_owner_management() -> Result<Self, TableError> {
        Self::new(SAFE_OWNER_SPECS)
    }

    pub fn lookup(&self, selector: &Selector) -> Option<&SchemaEntry> {
        self.by_selector.get(selector).map(|&i| &self.entries[i])
    }

    /// Match a full event topic; function selectors never match
    pub fn lookup_topic(&self, topic: &B256) -> Option<&SchemaEntry> {
        let selector = Selector::from_slice(topic.as_slice())?;
        self.lookup(&selector)
            .filter(|entry| entry.is_event() && entry.topic == *topic)
    }

    /// Match the selector leading a payload: functions and owner events,
    /// never the aggregate `SafeMultiSigTransaction` event
    pub fn lookup_prefix(&self, selector: &Selector) -> Option<&SchemaEntry> {
        self.lookup(selector)
            .filter(|entry| entry.kind != SelectorKind::AggregateEvent)
    }

    /// Topic hashes of every entry whose kind is in `kinds`
    pub fn event_topics(&self, kinds: &[SelectorKind]) -> Vec<B256> {
        self.entries
            .iter()
            .filter(|entry| entry.is_event() && kinds.contains(&entry.kind))
            .map(|entry| entry.topic)
            .collect()
    }

    pub fn entries(&self) -> &[SchemaEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static DEFAULT_TABLE: LazyLock<SelectorTable> = LazyLock::new(|| {
    SelectorTable::safe_owner_management().expect("built-in Safe selector specs are valid")
});

/// Process-wide Safe owner-management table
pub fn default_table() -> &'static SelectorTable {
    &DEFAULT_TABLE
}

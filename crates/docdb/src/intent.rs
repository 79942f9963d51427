//! Intent records, the reverse index and transaction metadata keys.
//!
//! Layout of the intents store:
//!
//! ```text
//! 0x0A <path> " <intent types> # <doc ht desc>   -> x <txn id> w <write id> <value>
//! x <txn id>                                    -> transaction metadata
//! x <txn id> # <doc ht desc>                    -> intent key (reverse index)
//! ```

use crate::doc_key::{ENCODED_DOC_HT_SUFFIX_SIZE, append_doc_ht, split_doc_ht};
use crate::encoding::{Decode, Encode, take_byte, take_bytes, take_u32_be};
use crate::error::{Error, Result};
use crate::value_type::ValueType;
use docstore_common::TransactionId;
use docstore_hlc::DocHybridTime;
use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentType {
    WeakRead = 0b0001,
    WeakWrite = 0b0010,
    StrongRead = 0b0100,
    StrongWrite = 0b1000,
}

impl IntentType {
    pub const ALL: [IntentType; 4] = [
        IntentType::WeakRead,
        IntentType::WeakWrite,
        IntentType::StrongRead,
        IntentType::StrongWrite,
    ];

    pub fn is_strong(self) -> bool {
        matches!(self, IntentType::StrongRead | IntentType::StrongWrite)
    }

    pub fn is_write(self) -> bool {
        matches!(self, IntentType::WeakWrite | IntentType::StrongWrite)
    }

    /// Two intents conflict when at least one is strong and at least one is
    /// a write.
    pub fn conflicts_with(self, other: IntentType) -> bool {
        (self.is_strong() || other.is_strong()) && (self.is_write() || other.is_write())
    }
}

/// Bit set of [`IntentType`]s held on one path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IntentTypeSet(u8);

impl IntentTypeSet {
    pub const EMPTY: IntentTypeSet = IntentTypeSet(0);

    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !0b1111 != 0 {
            return Err(Error::corruption(format!(
                "Invalid intent type set 0x{:02x}",
                bits
            )));
        }
        Ok(Self(bits))
    }

    pub fn single(intent_type: IntentType) -> Self {
        Self(intent_type as u8)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, intent_type: IntentType) -> bool {
        self.0 & intent_type as u8 != 0
    }

    pub fn insert(&mut self, intent_type: IntentType) {
        self.0 |= intent_type as u8;
    }

    pub fn union(self, other: IntentTypeSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = IntentType> {
        IntentType::ALL.into_iter().filter(move |t| self.contains(*t))
    }

    pub fn conflicts_with(self, other: IntentTypeSet) -> bool {
        self.iter()
            .any(|a| other.iter().any(|b| a.conflicts_with(b)))
    }

    pub fn has_strong_write(self) -> bool {
        self.contains(IntentType::StrongWrite)
    }

    /// Weak counterpart used on ancestor paths.
    pub fn to_weak(self) -> Self {
        let mut weak = IntentTypeSet::EMPTY;
        if self.contains(IntentType::StrongRead) || self.contains(IntentType::WeakRead) {
            weak.insert(IntentType::WeakRead);
        }
        if self.contains(IntentType::StrongWrite) || self.contains(IntentType::WeakWrite) {
            weak.insert(IntentType::WeakWrite);
        }
        weak
    }
}

impl From<IntentType> for IntentTypeSet {
    fn from(intent_type: IntentType) -> Self {
        IntentTypeSet::single(intent_type)
    }
}

impl fmt::Debug for IntentTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Size of `" <types> # <doc ht>` at the end of an intent key.
const INTENT_SUFFIX_SIZE: usize = 2 + ENCODED_DOC_HT_SUFFIX_SIZE;

pub fn is_intent_key(key: &[u8]) -> bool {
    key.first() == Some(&ValueType::IntentPrefix.as_byte())
}

/// Prefix shared by all intents on `path`, of any type and time.
pub fn intent_prefix(path: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(path.len() + 1);
    key.push(ValueType::IntentPrefix.as_byte());
    key.extend_from_slice(path);
    key
}

pub fn encode_intent_key(path: &[u8], types: IntentTypeSet, doc_ht: DocHybridTime) -> Vec<u8> {
    let mut key = intent_prefix(path);
    key.push(ValueType::IntentTypeSet.as_byte());
    key.push(types.bits());
    append_doc_ht(&mut key, doc_ht);
    key
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedIntentKey<'a> {
    /// Encoded sub-document path, without the intent prefix.
    pub path: &'a [u8],
    pub types: IntentTypeSet,
    pub doc_ht: DocHybridTime,
}

pub fn decode_intent_key(key: &[u8]) -> Result<DecodedIntentKey<'_>> {
    if !is_intent_key(key) || key.len() < 1 + INTENT_SUFFIX_SIZE {
        return Err(Error::corruption(format!(
            "Not an intent key: {:02x?}",
            key
        )));
    }
    let (without_ht, doc_ht) = split_doc_ht(key)?;
    let (path_with_prefix, types) = without_ht.split_at(without_ht.len() - 2);
    if types[0] != ValueType::IntentTypeSet.as_byte() {
        return Err(Error::corruption(format!(
            "Expected intent type tag, found 0x{:02x}",
            types[0]
        )));
    }
    Ok(DecodedIntentKey {
        path: &path_with_prefix[1..],
        types: IntentTypeSet::from_bits(types[1])?,
        doc_ht,
    })
}

/// Value of an intent record.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentValue {
    pub transaction_id: TransactionId,
    pub write_id: u32,
    /// Encoded [`crate::value::Value`]. Empty for weak and read intents.
    pub value: Vec<u8>,
}

impl Encode for IntentValue {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(ValueType::TransactionId.as_byte());
        out.extend_from_slice(&self.transaction_id.to_bytes());
        out.push(ValueType::WriteId.as_byte());
        out.extend_from_slice(&self.write_id.to_be_bytes());
        out.extend_from_slice(&self.value);
        Ok(())
    }
}

impl Decode for IntentValue {
    fn decode_from(input: &mut &[u8]) -> Result<Self> {
        expect_tag(input, ValueType::TransactionId)?;
        let transaction_id = decode_transaction_id(input)?;
        expect_tag(input, ValueType::WriteId)?;
        let write_id = take_u32_be(input)?;
        let value = input.to_vec();
        *input = &[];
        Ok(Self {
            transaction_id,
            write_id,
            value,
        })
    }
}

/// Transaction id of an intent value, without copying the payload.
pub fn intent_value_transaction(value: &[u8]) -> Result<TransactionId> {
    let mut input = value;
    expect_tag(&mut input, ValueType::TransactionId)?;
    decode_transaction_id(&mut input)
}

/// Key of the metadata record of a transaction. Also the prefix of all of
/// its reverse index entries.
pub fn transaction_metadata_key(transaction_id: TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + TransactionId::SIZE);
    key.push(ValueType::TransactionId.as_byte());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

pub fn reverse_index_key(transaction_id: TransactionId, doc_ht: DocHybridTime) -> Vec<u8> {
    let mut key = transaction_metadata_key(transaction_id);
    append_doc_ht(&mut key, doc_ht);
    key
}

/// A key of the intents store that is not an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKey {
    Metadata(TransactionId),
    ReverseIndex(TransactionId, DocHybridTime),
}

impl TransactionKey {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            TransactionKey::Metadata(id) | TransactionKey::ReverseIndex(id, _) => *id,
        }
    }
}

pub fn decode_transaction_key(key: &[u8]) -> Result<TransactionKey> {
    let mut input = key;
    expect_tag(&mut input, ValueType::TransactionId)?;
    let transaction_id = decode_transaction_id(&mut input)?;
    if input.is_empty() {
        return Ok(TransactionKey::Metadata(transaction_id));
    }
    let (_, doc_ht) = split_doc_ht(key)?;
    if input.len() != ENCODED_DOC_HT_SUFFIX_SIZE {
        return Err(Error::corruption(format!(
            "Malformed reverse index key of {} bytes",
            key.len()
        )));
    }
    Ok(TransactionKey::ReverseIndex(transaction_id, doc_ht))
}

fn expect_tag(input: &mut &[u8], tag: ValueType) -> Result<()> {
    let found = take_byte(input)?;
    if found != tag.as_byte() {
        return Err(Error::corruption(format!(
            "Expected {:?} tag, found 0x{:02x}",
            tag, found
        )));
    }
    Ok(())
}

fn decode_transaction_id(input: &mut &[u8]) -> Result<TransactionId> {
    let bytes = take_bytes(input, TransactionId::SIZE)?;
    TransactionId::from_slice(bytes).map_err(Error::Corruption)
}

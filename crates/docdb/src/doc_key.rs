//! Document keys and sub-document keys
//!
//! A document key is an optional hash-partitioned group followed by a range
//! group, each terminated by `GroupEnd`:
//!
//! ```text
//! [G <hash:u16> <hashed components...> !] <range components...> !
//! ```
//!
//! A sub-document key appends sub keys (column ids, map keys) and optionally
//! a `#` tag with the 12 byte descending [`DocHybridTime`], so that for one
//! path the newest version sorts first.

use crate::encoding::{Decode, Encode, take_byte, take_bytes};
use crate::error::{Error, Result};
use crate::primitive_value::PrimitiveValue;
use crate::value_type::ValueType;
use docstore_hlc::DocHybridTime;
use std::fmt;

/// Size of the `#` tag plus the encoded doc hybrid time.
pub const ENCODED_DOC_HT_SUFFIX_SIZE: usize = 1 + DocHybridTime::ENCODED_SIZE;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocKey {
    hash: Option<u16>,
    hashed_group: Vec<PrimitiveValue>,
    range_group: Vec<PrimitiveValue>,
}

impl DocKey {
    /// Range-only document key.
    pub fn from_range(range_group: Vec<PrimitiveValue>) -> Self {
        Self {
            hash: None,
            hashed_group: Vec::new(),
            range_group,
        }
    }

    /// Hash-partitioned document key; the partition hash is computed from
    /// the encoded hashed components.
    pub fn from_hashed(
        hashed_group: Vec<PrimitiveValue>,
        range_group: Vec<PrimitiveValue>,
    ) -> Result<Self> {
        if hashed_group.is_empty() {
            return Err(Error::InvalidArgument(
                "Hash partitioned key needs at least one hashed component".into(),
            ));
        }
        let hash = partition_hash(&hashed_group)?;
        Ok(Self {
            hash: Some(hash),
            hashed_group,
            range_group,
        })
    }

    pub fn hash(&self) -> Option<u16> {
        self.hash
    }

    pub fn hashed_group(&self) -> &[PrimitiveValue] {
        &self.hashed_group
    }

    pub fn range_group(&self) -> &[PrimitiveValue] {
        &self.range_group
    }
}

/// 16 bit partition hash of the hashed components.
pub fn partition_hash(hashed_group: &[PrimitiveValue]) -> Result<u16> {
    let mut encoded = Vec::new();
    for component in hashed_group {
        component.encode_key_to(&mut encoded)?;
    }
    Ok((xxhash_rust::xxh3::xxh3_64(&encoded) >> 48) as u16)
}

impl Encode for DocKey {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<()> {
        if let Some(hash) = self.hash {
            out.push(ValueType::UInt16Hash.as_byte());
            out.extend_from_slice(&hash.to_be_bytes());
            for component in &self.hashed_group {
                component.encode_key_to(out)?;
            }
            out.push(ValueType::GroupEnd.as_byte());
        }
        for component in &self.range_group {
            component.encode_key_to(out)?;
        }
        out.push(ValueType::GroupEnd.as_byte());
        Ok(())
    }
}

impl Decode for DocKey {
    fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let mut key = DocKey::default();
        if input.first() == Some(&ValueType::UInt16Hash.as_byte()) {
            take_byte(input)?;
            let hash = take_bytes(input, 2)?;
            key.hash = Some(u16::from_be_bytes([hash[0], hash[1]]));
            key.hashed_group = decode_group(input)?;
        }
        key.range_group = decode_group(input)?;
        Ok(key)
    }
}

fn decode_group(input: &mut &[u8]) -> Result<Vec<PrimitiveValue>> {
    let mut group = Vec::new();
    loop {
        match input.first() {
            None => return Err(Error::corruption("Document key group is not terminated")),
            Some(&b) if b == ValueType::GroupEnd.as_byte() => {
                take_byte(input)?;
                return Ok(group);
            }
            Some(_) => group.push(PrimitiveValue::decode_key_from(input)?),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocKey(")?;
        if let Some(hash) = self.hash {
            write!(f, "0x{:04x}, {:?}, ", hash, self.hashed_group)?;
        }
        write!(f, "{:?})", self.range_group)
    }
}

/// A path inside a document, optionally stamped with the time it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct SubDocKey {
    pub doc_key: DocKey,
    pub subkeys: Vec<PrimitiveValue>,
    pub doc_ht: Option<DocHybridTime>,
}

impl SubDocKey {
    pub fn new(doc_key: DocKey, subkeys: Vec<PrimitiveValue>) -> Self {
        Self {
            doc_key,
            subkeys,
            doc_ht: None,
        }
    }

    pub fn doc_only(doc_key: DocKey) -> Self {
        Self::new(doc_key, Vec::new())
    }

    pub fn with_ht(mut self, doc_ht: DocHybridTime) -> Self {
        self.doc_ht = Some(doc_ht);
        self
    }

    pub fn child(&self, subkey: PrimitiveValue) -> Self {
        let mut subkeys = self.subkeys.clone();
        subkeys.push(subkey);
        Self::new(self.doc_key.clone(), subkeys)
    }

    /// Encoded path without the hybrid time suffix.
    pub fn encode_without_ht(&self) -> Result<Vec<u8>> {
        let mut out = self.doc_key.encode()?;
        for subkey in &self.subkeys {
            subkey.encode_key_to(&mut out)?;
        }
        Ok(out)
    }

    /// Encoded keys of every proper ancestor, outermost (the document) first.
    pub fn encoded_ancestors(&self) -> Result<Vec<Vec<u8>>> {
        let mut out = self.doc_key.encode()?;
        let mut ancestors = Vec::with_capacity(self.subkeys.len());
        for subkey in &self.subkeys {
            ancestors.push(out.clone());
            subkey.encode_key_to(&mut out)?;
        }
        Ok(ancestors)
    }
}

impl Encode for SubDocKey {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<()> {
        self.doc_key.encode_to(out)?;
        for subkey in &self.subkeys {
            subkey.encode_key_to(out)?;
        }
        if let Some(doc_ht) = self.doc_ht {
            append_doc_ht(out, doc_ht);
        }
        Ok(())
    }
}

impl Decode for SubDocKey {
    fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let doc_key = DocKey::decode_from(input)?;
        let mut subkeys = Vec::new();
        let mut doc_ht = None;
        while let Some(&b) = input.first() {
            if b == ValueType::HybridTime.as_byte() {
                take_byte(input)?;
                let bytes = take_bytes(input, DocHybridTime::ENCODED_SIZE)?;
                doc_ht = Some(DocHybridTime::decode_desc(bytes).map_err(Error::Corruption)?);
                break;
            }
            subkeys.push(PrimitiveValue::decode_key_from(input)?);
        }
        Ok(Self {
            doc_key,
            subkeys,
            doc_ht,
        })
    }
}

impl fmt::Display for SubDocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubDocKey({}, {:?}", self.doc_key, self.subkeys)?;
        if let Some(doc_ht) = self.doc_ht {
            write!(f, "; {}", doc_ht)?;
        }
        write!(f, ")")
    }
}

/// Append `#` and the descending doc hybrid time.
pub fn append_doc_ht(out: &mut Vec<u8>, doc_ht: DocHybridTime) {
    out.push(ValueType::HybridTime.as_byte());
    doc_ht.append_encoded_desc(out);
}

/// Split a key that is known to end with a hybrid time suffix into the path
/// and the decoded time.
pub fn split_doc_ht(key: &[u8]) -> Result<(&[u8], DocHybridTime)> {
    if key.len() < ENCODED_DOC_HT_SUFFIX_SIZE {
        return Err(Error::corruption(format!(
            "Key of {} bytes is too short for a hybrid time suffix",
            key.len()
        )));
    }
    let (path, suffix) = key.split_at(key.len() - ENCODED_DOC_HT_SUFFIX_SIZE);
    if suffix[0] != ValueType::HybridTime.as_byte() {
        return Err(Error::corruption(format!(
            "Expected hybrid time tag, found 0x{:02x}",
            suffix[0]
        )));
    }
    let doc_ht = DocHybridTime::decode_desc(&suffix[1..]).map_err(Error::Corruption)?;
    Ok((path, doc_ht))
}

/// End offsets of the document key and of every sub key in an encoded path.
/// Entry `i` is the length of the prefix made of the first `i + 1`
/// components.
pub fn component_ends(path: &[u8]) -> Result<Vec<usize>> {
    let mut input = path;
    DocKey::decode_from(&mut input)?;
    let mut ends = vec![path.len() - input.len()];
    while !input.is_empty() {
        PrimitiveValue::decode_key_from(&mut input)?;
        ends.push(path.len() - input.len());
    }
    Ok(ends)
}

/// First sub key of an encoded path, if any.
pub fn first_subkey(path: &[u8]) -> Result<Option<PrimitiveValue>> {
    let mut input = path;
    DocKey::decode_from(&mut input)?;
    if input.is_empty() {
        return Ok(None);
    }
    PrimitiveValue::decode_key_from(&mut input).map(Some)
}

/// Smallest key strictly after every version of `path` itself but before
/// its children: `#` versions sort below every sub key tag.
pub fn past_sub_key_target(path: &[u8]) -> Vec<u8> {
    let mut target = path.to_vec();
    target.push(ValueType::HybridTime.as_byte() + 1);
    target
}

/// Smallest key after `path` and everything nested below it.
pub fn out_of_sub_doc_target(path: &[u8]) -> Vec<u8> {
    let mut target = path.to_vec();
    target.push(ValueType::MaxByte.as_byte());
    target
}

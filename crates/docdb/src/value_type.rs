//! One-byte tags that prefix every encoded key component and value.
//!
//! The numeric order of the tags is part of the on-disk format: the group
//! end, intent type and hybrid time tags sort below every primitive tag so
//! that a document's own records come before its children.

use crate::error::{Error, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    /// Prefix of every key in the intents store that is an intent.
    IntentPrefix = 0x0A,
    /// Terminates the hashed and range groups of a document key.
    GroupEnd = b'!',
    /// Precedes the intent type byte in an intent key.
    IntentTypeSet = b'"',
    /// Precedes the descending doc hybrid time suffix.
    HybridTime = b'#',
    Null = b'$',
    Double = b'D',
    False = b'F',
    UInt16Hash = b'G',
    Int32 = b'H',
    Int64 = b'I',
    ColumnId = b'K',
    String = b'S',
    True = b'T',
    /// Deletion marker, values only.
    Tombstone = b'X',
    StringDescending = b'a',
    Int64Descending = b'd',
    /// Merge flags prefix inside a value.
    MergeFlags = b'k',
    /// TTL prefix inside a value.
    Ttl = b't',
    /// Write id prefix inside an intent value.
    WriteId = b'w',
    /// Transaction id prefix of intent values and reverse index keys.
    TransactionId = b'x',
    /// Object (map) initialization marker, values only.
    Object = b'{',
    MaxByte = 0xFF,
}

impl ValueType {
    pub fn from_u8(byte: u8) -> Result<Self> {
        let value_type = match byte {
            0x0A => ValueType::IntentPrefix,
            b'!' => ValueType::GroupEnd,
            b'"' => ValueType::IntentTypeSet,
            b'#' => ValueType::HybridTime,
            b'$' => ValueType::Null,
            b'D' => ValueType::Double,
            b'F' => ValueType::False,
            b'G' => ValueType::UInt16Hash,
            b'H' => ValueType::Int32,
            b'I' => ValueType::Int64,
            b'K' => ValueType::ColumnId,
            b'S' => ValueType::String,
            b'T' => ValueType::True,
            b'X' => ValueType::Tombstone,
            b'a' => ValueType::StringDescending,
            b'd' => ValueType::Int64Descending,
            b'k' => ValueType::MergeFlags,
            b't' => ValueType::Ttl,
            b'w' => ValueType::WriteId,
            b'x' => ValueType::TransactionId,
            b'{' => ValueType::Object,
            0xFF => ValueType::MaxByte,
            other => {
                return Err(Error::corruption(format!(
                    "Unknown value type byte 0x{:02x}",
                    other
                )));
            }
        };
        Ok(value_type)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this tag may start a primitive key component.
    pub fn is_key_primitive(self) -> bool {
        matches!(
            self,
            ValueType::Null
                | ValueType::Double
                | ValueType::False
                | ValueType::Int32
                | ValueType::Int64
                | ValueType::ColumnId
                | ValueType::String
                | ValueType::True
                | ValueType::StringDescending
                | ValueType::Int64Descending
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_tags_sort_below_primitives() {
        let structural = [
            ValueType::GroupEnd,
            ValueType::IntentTypeSet,
            ValueType::HybridTime,
        ];
        for tag in structural {
            assert!(tag < ValueType::Null);
            assert!(!tag.is_key_primitive());
        }
        assert!(ValueType::IntentPrefix < ValueType::GroupEnd);
    }

    #[test]
    fn test_byte_mapping() {
        for byte in [b'!', b'#', b'S', b'I', b'X', b'{', b't', 0x0A] {
            assert_eq!(ValueType::from_u8(byte).unwrap().as_byte(), byte);
        }
        assert!(ValueType::from_u8(b'?').is_err());
    }
}

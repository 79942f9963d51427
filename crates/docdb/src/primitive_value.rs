//! Primitive values and their key and value encodings
//!
//! Key encodings are byte-comparable: comparing two encoded components with
//! `memcmp` gives the same answer as comparing the values. Value encodings
//! only need to be decodable.

use crate::encoding::{take_byte, take_bytes, take_u32_be, take_u64_be};
use crate::error::{Error, Result};
use crate::value_type::ValueType;
use std::fmt;

const SIGN_BIT: u64 = 1 << 63;

#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveValue {
    Null,
    False,
    True,
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    /// Column identifier, used as the first sub key of a row.
    ColumnId(u32),
    StringDescending(String),
    Int64Descending(i64),
    /// Deletion marker. Only valid as a value.
    Tombstone,
    /// Object initialization marker. Only valid as a value.
    Object,
}

impl PrimitiveValue {
    pub fn string(s: impl Into<String>) -> Self {
        PrimitiveValue::String(s.into())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            PrimitiveValue::Null => ValueType::Null,
            PrimitiveValue::False => ValueType::False,
            PrimitiveValue::True => ValueType::True,
            PrimitiveValue::Int32(_) => ValueType::Int32,
            PrimitiveValue::Int64(_) => ValueType::Int64,
            PrimitiveValue::Double(_) => ValueType::Double,
            PrimitiveValue::String(_) => ValueType::String,
            PrimitiveValue::ColumnId(_) => ValueType::ColumnId,
            PrimitiveValue::StringDescending(_) => ValueType::StringDescending,
            PrimitiveValue::Int64Descending(_) => ValueType::Int64Descending,
            PrimitiveValue::Tombstone => ValueType::Tombstone,
            PrimitiveValue::Object => ValueType::Object,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, PrimitiveValue::Tombstone)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PrimitiveValue::Int32(v) => Some(*v as i64),
            PrimitiveValue::Int64(v) | PrimitiveValue::Int64Descending(v) => Some(*v),
            _ => None,
        }
    }

    /// Append the byte-comparable key encoding.
    pub fn encode_key_to(&self, out: &mut Vec<u8>) -> Result<()> {
        let value_type = self.value_type();
        if !value_type.is_key_primitive() {
            return Err(Error::corruption(format!(
                "Value type {:?} cannot be used in a key",
                value_type
            )));
        }
        out.push(value_type.as_byte());
        match self {
            PrimitiveValue::Null | PrimitiveValue::False | PrimitiveValue::True => {}
            PrimitiveValue::Int32(v) => {
                out.extend_from_slice(&((*v as u32) ^ (1 << 31)).to_be_bytes());
            }
            PrimitiveValue::Int64(v) => {
                out.extend_from_slice(&((*v as u64) ^ SIGN_BIT).to_be_bytes());
            }
            PrimitiveValue::Int64Descending(v) => {
                out.extend_from_slice(&(!((*v as u64) ^ SIGN_BIT)).to_be_bytes());
            }
            PrimitiveValue::Double(v) => {
                let bits = v.to_bits();
                let ordered = if bits & SIGN_BIT != 0 {
                    !bits
                } else {
                    bits ^ SIGN_BIT
                };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            PrimitiveValue::String(s) => append_zero_escaped(out, s.as_bytes(), false),
            PrimitiveValue::StringDescending(s) => append_zero_escaped(out, s.as_bytes(), true),
            PrimitiveValue::ColumnId(id) => out.extend_from_slice(&id.to_be_bytes()),
            PrimitiveValue::Tombstone | PrimitiveValue::Object => unreachable!(),
        }
        Ok(())
    }

    /// Decode one key component from the front of `input`.
    pub fn decode_key_from(input: &mut &[u8]) -> Result<Self> {
        let value_type = ValueType::from_u8(take_byte(input)?)?;
        let value = match value_type {
            ValueType::Null => PrimitiveValue::Null,
            ValueType::False => PrimitiveValue::False,
            ValueType::True => PrimitiveValue::True,
            ValueType::Int32 => PrimitiveValue::Int32((take_u32_be(input)? ^ (1 << 31)) as i32),
            ValueType::Int64 => PrimitiveValue::Int64((take_u64_be(input)? ^ SIGN_BIT) as i64),
            ValueType::Int64Descending => {
                PrimitiveValue::Int64Descending(((!take_u64_be(input)?) ^ SIGN_BIT) as i64)
            }
            ValueType::Double => {
                let ordered = take_u64_be(input)?;
                let bits = if ordered & SIGN_BIT != 0 {
                    ordered ^ SIGN_BIT
                } else {
                    !ordered
                };
                PrimitiveValue::Double(f64::from_bits(bits))
            }
            ValueType::String => PrimitiveValue::String(utf8(take_zero_escaped(input, false)?)?),
            ValueType::StringDescending => {
                PrimitiveValue::StringDescending(utf8(take_zero_escaped(input, true)?)?)
            }
            ValueType::ColumnId => PrimitiveValue::ColumnId(take_u32_be(input)?),
            other => {
                return Err(Error::corruption(format!(
                    "Value type {:?} is not a key component",
                    other
                )));
            }
        };
        Ok(value)
    }

    /// Append the value encoding: tag byte followed by the raw payload.
    pub fn encode_value_to(&self, out: &mut Vec<u8>) {
        out.push(self.value_type().as_byte());
        match self {
            PrimitiveValue::Null
            | PrimitiveValue::False
            | PrimitiveValue::True
            | PrimitiveValue::Tombstone
            | PrimitiveValue::Object => {}
            PrimitiveValue::Int32(v) => out.extend_from_slice(&v.to_be_bytes()),
            PrimitiveValue::Int64(v) | PrimitiveValue::Int64Descending(v) => {
                out.extend_from_slice(&v.to_be_bytes())
            }
            PrimitiveValue::Double(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
            PrimitiveValue::String(s) | PrimitiveValue::StringDescending(s) => {
                out.extend_from_slice(s.as_bytes())
            }
            PrimitiveValue::ColumnId(id) => out.extend_from_slice(&id.to_be_bytes()),
        }
    }

    /// Decode a value encoding that spans all of `bytes`.
    pub fn decode_value(bytes: &[u8]) -> Result<Self> {
        let mut input = bytes;
        let value_type = ValueType::from_u8(take_byte(&mut input)?)?;
        let value = match value_type {
            ValueType::Null => PrimitiveValue::Null,
            ValueType::False => PrimitiveValue::False,
            ValueType::True => PrimitiveValue::True,
            ValueType::Tombstone => PrimitiveValue::Tombstone,
            ValueType::Object => PrimitiveValue::Object,
            ValueType::Int32 => PrimitiveValue::Int32(take_u32_be(&mut input)? as i32),
            ValueType::Int64 => PrimitiveValue::Int64(take_u64_be(&mut input)? as i64),
            ValueType::Int64Descending => {
                PrimitiveValue::Int64Descending(take_u64_be(&mut input)? as i64)
            }
            ValueType::Double => PrimitiveValue::Double(f64::from_bits(take_u64_be(&mut input)?)),
            ValueType::String => {
                let s = utf8(input.to_vec())?;
                input = &[];
                PrimitiveValue::String(s)
            }
            ValueType::StringDescending => {
                let s = utf8(input.to_vec())?;
                input = &[];
                PrimitiveValue::StringDescending(s)
            }
            ValueType::ColumnId => PrimitiveValue::ColumnId(take_u32_be(&mut input)?),
            other => {
                return Err(Error::corruption(format!(
                    "Value type {:?} is not a primitive value",
                    other
                )));
            }
        };
        if !input.is_empty() {
            return Err(Error::corruption(format!(
                "{} trailing bytes after {:?} value",
                input.len(),
                value_type
            )));
        }
        Ok(value)
    }
}

impl fmt::Display for PrimitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveValue::Null => write!(f, "null"),
            PrimitiveValue::False => write!(f, "false"),
            PrimitiveValue::True => write!(f, "true"),
            PrimitiveValue::Int32(v) => write!(f, "{}", v),
            PrimitiveValue::Int64(v) | PrimitiveValue::Int64Descending(v) => write!(f, "{}", v),
            PrimitiveValue::Double(v) => write!(f, "{}", v),
            PrimitiveValue::String(s) | PrimitiveValue::StringDescending(s) => {
                write!(f, "\"{}\"", s)
            }
            PrimitiveValue::ColumnId(id) => write!(f, "ColumnId({})", id),
            PrimitiveValue::Tombstone => write!(f, "DEL"),
            PrimitiveValue::Object => write!(f, "{{}}"),
        }
    }
}

impl From<i64> for PrimitiveValue {
    fn from(v: i64) -> Self {
        PrimitiveValue::Int64(v)
    }
}

impl From<&str> for PrimitiveValue {
    fn from(s: &str) -> Self {
        PrimitiveValue::String(s.to_string())
    }
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::corruption(format!("Invalid UTF-8 string: {}", e)))
}

/// `\0` becomes `\0\x01` and the string ends with `\0\0`, so a string sorts
/// before every longer string it is a prefix of. Descending strings are the
/// bitwise complement of the ascending encoding.
fn append_zero_escaped(out: &mut Vec<u8>, bytes: &[u8], descending: bool) {
    let mask = if descending { 0xFF } else { 0x00 };
    for &b in bytes {
        out.push(b ^ mask);
        if b == 0 {
            out.push(0x01 ^ mask);
        }
    }
    out.push(mask);
    out.push(mask);
}

fn take_zero_escaped(input: &mut &[u8], descending: bool) -> Result<Vec<u8>> {
    let mask = if descending { 0xFF } else { 0x00 };
    let mut result = Vec::new();
    loop {
        let b = take_byte(input)? ^ mask;
        if b != 0 {
            result.push(b);
            continue;
        }
        match take_bytes(input, 1)?[0] ^ mask {
            0x00 => return Ok(result),
            0x01 => result.push(0),
            other => {
                return Err(Error::corruption(format!(
                    "Invalid escape byte 0x{:02x} in string",
                    other
                )));
            }
        }
    }
}

//! Encoding/decoding traits for document store records
//!
//! Keys must be byte-comparable, so instead of Serde every key-side type
//! implements these traits with a hand-written order-preserving encoding.

use crate::error::{Error, Result};

/// Encode a value to bytes
pub trait Encode {
    /// Append the encoding to `out`.
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<()>;

    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_to(&mut out)?;
        Ok(out)
    }
}

/// Decode a value from bytes
pub trait Decode: Sized {
    /// Decode from the front of `input`, advancing it past the consumed bytes.
    fn decode_from(input: &mut &[u8]) -> Result<Self>;

    /// Decode from exactly `bytes`; trailing data is corruption.
    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut input = bytes;
        let value = Self::decode_from(&mut input)?;
        if !input.is_empty() {
            return Err(Error::corruption(format!(
                "{} trailing bytes after decoded value",
                input.len()
            )));
        }
        Ok(value)
    }
}

/// Pop one byte off the front of `input`.
pub(crate) fn take_byte(input: &mut &[u8]) -> Result<u8> {
    let (&first, rest) = input
        .split_first()
        .ok_or_else(|| Error::corruption("Unexpected end of input"))?;
    *input = rest;
    Ok(first)
}

/// Pop `n` bytes off the front of `input`.
pub(crate) fn take_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(Error::corruption(format!(
            "Expected {} bytes, got {}",
            n,
            input.len()
        )));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

pub(crate) fn take_u32_be(input: &mut &[u8]) -> Result<u32> {
    let bytes = take_bytes(input, 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn take_u64_be(input: &mut &[u8]) -> Result<u64> {
    let bytes = take_bytes(input, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

impl Encode for u64 {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.to_be_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    fn decode_from(input: &mut &[u8]) -> Result<Self> {
        take_u64_be(input)
    }
}

impl Encode for Vec<u8> {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(self);
        Ok(())
    }
}

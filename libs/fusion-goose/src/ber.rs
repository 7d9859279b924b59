//! Minimal BER TLV codec
//!
//! Only single-byte tags are used by GOOSE. Lengths use the short form below 0x80
//! and the long form (`0x81 n` / `0x82 hi lo`) above.

use crate::error::{GooseError, GooseResult};
use bytes::{BufMut, BytesMut};

/// One tag-length-value element with an owned value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerEntry {
    pub tag: u8,
    pub value: Vec<u8>,
}

impl BerEntry {
    pub fn new(tag: u8, value: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> GooseResult<()> {
        write_tlv(buf, self.tag, &self.value)
    }
}

/// Append a TLV element
pub fn write_tlv(buf: &mut BytesMut, tag: u8, value: &[u8]) -> GooseResult<()> {
    buf.put_u8(tag);
    write_length(buf, value.len())?;
    buf.put_slice(value);
    Ok(())
}

fn write_length(buf: &mut BytesMut, len: usize) -> GooseResult<()> {
    match len {
        0..=0x7F => buf.put_u8(len as u8),
        0x80..=0xFF => {
            buf.put_u8(0x81);
            buf.put_u8(len as u8);
        },
        0x100..=0xFFFF => {
            buf.put_u8(0x82);
            buf.put_u16(len as u16);
        },
        _ => return Err(GooseError::encoding(format!("BER value too long: {len} bytes"))),
    }
    Ok(())
}

/// Fixed-width big-endian integer value
pub fn encode_u32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Big-endian unsigned integer of one to four bytes
pub fn decode_u32(value: &[u8]) -> GooseResult<u32> {
    if value.is_empty() || value.len() > 4 {
        return Err(GooseError::decoding(format!(
            "Integer of {} bytes does not fit u32",
            value.len()
        )));
    }
    Ok(value.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

/// Single-byte value
pub fn decode_u8(value: &[u8]) -> GooseResult<u8> {
    match value {
        [b] => Ok(*b),
        _ => Err(GooseError::decoding(format!(
            "Expected a single byte, got {}",
            value.len()
        ))),
    }
}

/// Sequential reader over concatenated TLV elements
pub struct BerReader<'a> {
    data: &'a [u8],
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Next element as `(tag, value)`
    pub fn next_entry(&mut self) -> GooseResult<(u8, &'a [u8])> {
        let (&tag, rest) = self
            .data
            .split_first()
            .ok_or_else(|| GooseError::decoding("Unexpected end of BER data"))?;
        let (len, rest) = read_length(rest)?;
        if rest.len() < len {
            return Err(GooseError::decoding(format!(
                "BER element 0x{tag:02X} declares {len} bytes, {} available",
                rest.len()
            )));
        }
        let (value, rest) = rest.split_at(len);
        self.data = rest;
        Ok((tag, value))
    }

    /// Next element, which must carry `tag`
    pub fn expect(&mut self, tag: u8, field: &str) -> GooseResult<&'a [u8]> {
        let (found, value) = self.next_entry()?;
        if found != tag {
            return Err(GooseError::decoding(format!(
                "{field}: expected tag 0x{tag:02X}, found 0x{found:02X}"
            )));
        }
        Ok(value)
    }
}

fn read_length(data: &[u8]) -> GooseResult<(usize, &[u8])> {
    let (&first, rest) = data
        .split_first()
        .ok_or_else(|| GooseError::decoding("Missing BER length"))?;
    if first < 0x80 {
        return Ok((usize::from(first), rest));
    }
    let octets = usize::from(first & 0x7F);
    if octets == 0 || octets > 2 {
        return Err(GooseError::decoding(format!(
            "Unsupported BER length form 0x{first:02X}"
        )));
    }
    if rest.len() < octets {
        return Err(GooseError::decoding("Truncated BER length"));
    }
    let len = rest[..octets]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
    Ok((len, &rest[octets..]))
}

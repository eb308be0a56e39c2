//! Primitive wire encodings shared by every codec in the protocol.
//!
//! Fixed-width integers are little-endian. Lengths and descriptor fields use a
//! 7-bit continuation varint (low group first, high bit set while more groups
//! follow). Strings and byte blobs are a varint length followed by the bytes.
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Longest varint a `u64` can produce.
const MAX_VARINT_LEN: usize = 10;

/// Errors raised while encoding or decoding protocol data. All of them are
/// fatal to the exchange they occur in.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input reading {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("varint longer than {MAX_VARINT_LEN} bytes")]
    VarintOverflow,

    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("unknown command code {0}")]
    UnknownCommand(i32),

    #[error("unknown data type tag {0}")]
    UnknownDataType(u8),

    #[error("unknown structure kind {0}")]
    UnknownStructureKind(u64),

    #[error("negative {what} count {count}")]
    NegativeCount { what: &'static str, count: i64 },

    #[error("value does not match declared type {expected}")]
    TypeMismatch { expected: String },

    #[error("data type nested deeper than {0} levels")]
    TypeTooDeep(usize),

    #[error("{what} count {count} does not fit the wire format")]
    CountOverflow { what: &'static str, count: usize },

    #[error("typed value on an untyped channel")]
    Untyped,

    #[error("cannot find descriptor with id {0}")]
    UnresolvedDescriptor(i64),

    #[error("{0} bytes left over after decoding")]
    TrailingBytes(usize),
}

fn ensure(buf: &&[u8], need: usize, what: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < need {
        return Err(CodecError::Truncated {
            what,
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}

pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn get_varint(buf: &mut &[u8]) -> Result<u64, CodecError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        ensure(buf, 1, "varint")?;
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::VarintOverflow)
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn get_bool(buf: &mut &[u8]) -> Result<bool, CodecError> {
    ensure(buf, 1, "bool")?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(CodecError::InvalidBool(b)),
    }
}

pub fn get_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    ensure(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub fn get_i32(buf: &mut &[u8]) -> Result<i32, CodecError> {
    ensure(buf, 4, "i32")?;
    Ok(buf.get_i32_le())
}

pub fn get_i64(buf: &mut &[u8]) -> Result<i64, CodecError> {
    ensure(buf, 8, "i64")?;
    Ok(buf.get_i64_le())
}

pub fn get_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    ensure(buf, 8, "u64")?;
    Ok(buf.get_u64_le())
}

pub fn get_f64(buf: &mut &[u8]) -> Result<f64, CodecError> {
    ensure(buf, 8, "f64")?;
    Ok(buf.get_f64_le())
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = get_varint(buf)? as usize;
    take(buf, len, "byte blob")
}

/// Reads exactly `len` raw bytes.
pub fn take(buf: &mut &[u8], len: usize, what: &'static str) -> Result<Vec<u8>, CodecError> {
    ensure(buf, len, what)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub fn get_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    String::from_utf8(get_bytes(buf)?).map_err(|_| CodecError::InvalidUtf8)
}

pub fn put_opt_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    put_bool(buf, value.is_some());
    if let Some(bytes) = value {
        put_bytes(buf, bytes);
    }
}

pub fn get_opt_bytes(buf: &mut &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
    if get_bool(buf)? {
        Ok(Some(get_bytes(buf)?))
    } else {
        Ok(None)
    }
}

/// Reads an i32 element count, rejecting negative values.
pub fn get_count(buf: &mut &[u8], what: &'static str) -> Result<usize, CodecError> {
    let count = get_i32(buf)?;
    usize::try_from(count).map_err(|_| CodecError::NegativeCount {
        what,
        count: i64::from(count),
    })
}

/// Converts an element count to its i32 wire form.
pub fn count_i32(count: usize, what: &'static str) -> Result<i32, CodecError> {
    i32::try_from(count).map_err(|_| CodecError::CountOverflow { what, count })
}

pub fn expect_end(buf: &[u8]) -> Result<(), CodecError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(CodecError::TrailingBytes(buf.len()))
    }
}

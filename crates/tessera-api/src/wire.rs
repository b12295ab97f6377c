//! Binary wire encoding helpers
//!
//! All coordination payloads use an explicit big-endian encoding with
//! length-prefixed strings. Decoders never panic on short or garbled
//! input; they return `WireError` so the caller can drop the packet.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Error types for wire decoding
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated payload")]
    Truncated,

    #[error("unknown tag: {0}")]
    UnknownTag(u32),

    #[error("invalid utf-8 in string field")]
    InvalidString,

    #[error("invalid value for field '{0}'")]
    InvalidValue(&'static str),
}

/// Result type for decode operations
pub type WireResult<T> = Result<T, WireError>;

pub fn put_string(buf: &mut impl BufMut, value: &str) {
    let bytes = value.as_bytes();
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

pub fn put_bytes(buf: &mut impl BufMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub fn get_u8(buf: &mut impl Buf) -> WireResult<u8> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut impl Buf) -> WireResult<u16> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut impl Buf) -> WireResult<u32> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32())
}

pub fn get_i32(buf: &mut impl Buf) -> WireResult<i32> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_i32())
}

pub fn get_u64(buf: &mut impl Buf) -> WireResult<u64> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64())
}

pub fn get_i64(buf: &mut impl Buf) -> WireResult<i64> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_i64())
}

pub fn get_string(buf: &mut impl Buf) -> WireResult<String> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| WireError::InvalidString)
}

pub fn get_bytes(buf: &mut impl Buf) -> WireResult<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

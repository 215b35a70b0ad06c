//! Canonical CBOR primitives shared by the payload and envelope codecs.
//!
//! Canonical form: definite lengths only, shortest integer encodings, map keys
//! sorted bytewise, duplicate keys rejected. Every decode path is bounded by
//! `Limits` so a hostile frame cannot balloon memory.

use std::collections::BTreeSet;
use std::convert::Infallible;

use minicbor::data::Type;
use minicbor::Decoder;
use thiserror::Error;

use super::limits::Limits;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),
    #[error("duplicate map key: {0}")]
    DuplicateKey(String),
    #[error("trailing bytes after body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

pub fn ensure_unique_key<'a>(
    seen: &mut BTreeSet<&'a str>,
    key: &'a str,
) -> Result<(), DecodeError> {
    if seen.insert(key) {
        Ok(())
    } else {
        Err(DecodeError::DuplicateKey(key.to_string()))
    }
}

fn ensure_depth(depth: usize, limits: &Limits) -> Result<(), DecodeError> {
    if depth > limits.max_cbor_depth {
        return Err(DecodeError::DecodeLimit("max_cbor_depth"));
    }
    Ok(())
}

fn current_byte(dec: &Decoder) -> Result<u8, DecodeError> {
    dec.input()
        .get(dec.position())
        .copied()
        .ok_or_else(|| minicbor::decode::Error::end_of_input().into())
}

fn canonical_unsigned(first: u8, value: u64) -> bool {
    match value {
        0..=23 => first == value as u8,
        24..=0xff => first == 0x18,
        0x100..=0xffff => first == 0x19,
        0x1_0000..=0xffff_ffff => first == 0x1a,
        _ => first == 0x1b,
    }
}

fn canonical_len(first: u8, len: u64, major_base: u8) -> bool {
    canonical_unsigned(first.wrapping_sub(major_base), len)
}

fn non_canonical_integer(field: &'static str) -> DecodeError {
    DecodeError::InvalidField {
        field,
        reason: "non-canonical integer encoding".into(),
    }
}

pub fn decode_map_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, DecodeError> {
    ensure_depth(depth, limits)?;
    let first = current_byte(dec)?;
    let Some(len) = dec.map()? else {
        return Err(DecodeError::IndefiniteLength);
    };
    if !canonical_len(first, len, 0xa0) {
        return Err(non_canonical_integer("map_len"));
    }
    if len > limits.max_cbor_map_entries as u64 {
        return Err(DecodeError::DecodeLimit("max_cbor_map_entries"));
    }
    usize::try_from(len).map_err(|_| DecodeError::DecodeLimit("max_cbor_map_entries"))
}

pub fn decode_array_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, DecodeError> {
    ensure_depth(depth, limits)?;
    let first = current_byte(dec)?;
    let Some(len) = dec.array()? else {
        return Err(DecodeError::IndefiniteLength);
    };
    if !canonical_len(first, len, 0x80) {
        return Err(non_canonical_integer("array_len"));
    }
    if len > limits.max_cbor_array_entries as u64 {
        return Err(DecodeError::DecodeLimit("max_cbor_array_entries"));
    }
    usize::try_from(len).map_err(|_| DecodeError::DecodeLimit("max_cbor_array_entries"))
}

pub fn decode_text<'a>(dec: &mut Decoder<'a>, limits: &Limits) -> Result<&'a str, DecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(DecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_cbor_text_len {
        return Err(DecodeError::DecodeLimit("max_cbor_text_len"));
    }
    Ok(s)
}

pub fn decode_byte_string<'a>(
    dec: &mut Decoder<'a>,
    limits: &Limits,
) -> Result<&'a [u8], DecodeError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(DecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_cbor_bytes_len {
        return Err(DecodeError::DecodeLimit("max_cbor_bytes_len"));
    }
    Ok(bytes)
}

pub fn decode_u64(dec: &mut Decoder, field: &'static str) -> Result<u64, DecodeError> {
    let first = current_byte(dec)?;
    match dec.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
            let value = dec.u64()?;
            if !canonical_unsigned(first, value) {
                return Err(non_canonical_integer(field));
            }
            Ok(value)
        }
        other => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected unsigned integer, got {other:?}"),
        }),
    }
}

pub fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, DecodeError> {
    let value = decode_u64(dec, field)?;
    u32::try_from(value).map_err(|_| DecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u32"),
    })
}

pub fn decode_u8(dec: &mut Decoder, field: &'static str) -> Result<u8, DecodeError> {
    let value = decode_u64(dec, field)?;
    u8::try_from(value).map_err(|_| DecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u8"),
    })
}

pub fn decode_i64(dec: &mut Decoder, field: &'static str) -> Result<i64, DecodeError> {
    let first = current_byte(dec)?;
    match dec.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
            let value = dec.u64()?;
            if !canonical_unsigned(first, value) {
                return Err(non_canonical_integer(field));
            }
            i64::try_from(value).map_err(|_| DecodeError::InvalidField {
                field,
                reason: format!("value {value} out of range for i64"),
            })
        }
        Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Int => {
            let value = dec.i64()?;
            // Negative payload: canonical check against the encoded magnitude.
            let magnitude = (-1i128 - value as i128) as u64;
            if !canonical_unsigned(first.wrapping_sub(0x20), magnitude) {
                return Err(non_canonical_integer(field));
            }
            Ok(value)
        }
        other => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected integer, got {other:?}"),
        }),
    }
}

pub fn skip_value(dec: &mut Decoder, limits: &Limits, depth: usize) -> Result<(), DecodeError> {
    ensure_depth(depth, limits)?;
    match dec.datatype()? {
        Type::Bool => {
            let _ = dec.bool()?;
        }
        Type::Null => {
            dec.null()?;
        }
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
            let _ = dec.u64()?;
        }
        Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Int => {
            let _ = dec.i64()?;
        }
        Type::String | Type::StringIndef => {
            let _ = decode_text(dec, limits)?;
        }
        Type::Bytes | Type::BytesIndef => {
            let _ = decode_byte_string(dec, limits)?;
        }
        Type::Map => {
            let len = decode_map_len(dec, limits, depth)?;
            for _ in 0..len {
                skip_value(dec, limits, depth + 1)?;
                skip_value(dec, limits, depth + 1)?;
            }
        }
        Type::Array => {
            let len = decode_array_len(dec, limits, depth)?;
            for _ in 0..len {
                skip_value(dec, limits, depth + 1)?;
            }
        }
        other => {
            return Err(DecodeError::InvalidField {
                field: "cbor",
                reason: format!("unsupported type {other:?}"),
            });
        }
    }
    Ok(())
}

pub fn ensure_fully_consumed(dec: &mut Decoder) -> Result<(), DecodeError> {
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicbor::Encoder;

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn rejects_indefinite_map() {
        // 0xbf = indefinite map, 0xff = break
        let bytes = [0xbfu8, 0xff];
        let mut dec = Decoder::new(&bytes);
        let err = decode_map_len(&mut dec, &limits(), 0).unwrap_err();
        assert!(matches!(err, DecodeError::IndefiniteLength));
    }

    #[test]
    fn rejects_non_canonical_integer() {
        // 5 encoded with a one-byte argument (0x18 0x05) instead of immediate
        let bytes = [0x18u8, 0x05];
        let mut dec = Decoder::new(&bytes);
        assert!(decode_u64(&mut dec, "n").is_err());
    }

    #[test]
    fn i64_roundtrips_negative_values() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.i64(-42).unwrap();
        let mut dec = Decoder::new(&buf);
        assert_eq!(decode_i64(&mut dec, "n").unwrap(), -42);
    }

    #[test]
    fn skip_value_handles_nested_containers() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap();
        enc.str("a").unwrap();
        enc.array(2).unwrap();
        enc.u64(1).unwrap();
        enc.str("b").unwrap();
        let mut dec = Decoder::new(&buf);
        skip_value(&mut dec, &limits(), 0).unwrap();
        ensure_fully_consumed(&mut dec).unwrap();
    }
}

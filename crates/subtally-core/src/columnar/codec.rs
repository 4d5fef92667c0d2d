//! Column codec trait and implementations for `.stx` files.
//!
//! Every column starts with a presence bitmap (one bit per row, LSB first)
//! so nulls cost one bit. Present values follow in a type-specific encoding.

use std::collections::HashMap;

use super::CodecError;

/// Encoding and decoding of a single nullable column.
pub trait ColumnCodec {
    /// The decoded Rust type for elements in this column.
    type Item;

    /// Encode a slice of items into bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    fn encode(items: &[Self::Item], buf: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Decode `count` items from a byte slice.
    ///
    /// Returns the decoded items and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on truncated or malformed data.
    fn decode(data: &[u8], count: usize) -> Result<(Vec<Self::Item>, usize), CodecError>;
}

// ---------------------------------------------------------------------------
// Primitive helpers
// ---------------------------------------------------------------------------

/// Encode an unsigned 64-bit value as LEB128.
pub(crate) fn encode_varint(value: u64, buf: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode a LEB128 varint, returning the value and bytes consumed.
pub(crate) fn decode_varint(data: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(CodecError::DataCorrupted("varint overflow".into()));
        }
    }
    Err(CodecError::UnexpectedEof)
}

#[inline]
#[allow(clippy::cast_sign_loss)]
pub(crate) const fn zigzag_encode(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

#[inline]
#[allow(clippy::cast_possible_wrap)]
pub(crate) const fn zigzag_decode(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

pub(crate) fn read_u32(data: &[u8], pos: usize) -> Result<u32, CodecError> {
    let bytes = data.get(pos..pos + 4).ok_or(CodecError::UnexpectedEof)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw))
}

pub(crate) fn read_u64(data: &[u8], pos: usize) -> Result<u64, CodecError> {
    let bytes = data.get(pos..pos + 8).ok_or(CodecError::UnexpectedEof)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

fn len_u32(n: usize, what: &str) -> Result<u32, CodecError> {
    u32::try_from(n).map_err(|_| CodecError::DataCorrupted(format!("{what} exceeds u32")))
}

// ---------------------------------------------------------------------------
// Presence bitmap
// ---------------------------------------------------------------------------

fn encode_presence<T>(items: &[Option<T>], buf: &mut Vec<u8>) {
    let mut bytes = vec![0u8; items.len().div_ceil(8)];
    for (i, item) in items.iter().enumerate() {
        if item.is_some() {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    buf.extend_from_slice(&bytes);
}

fn decode_presence(data: &[u8], count: usize) -> Result<(Vec<bool>, usize), CodecError> {
    let len = count.div_ceil(8);
    let bytes = data.get(..len).ok_or(CodecError::UnexpectedEof)?;
    let present = (0..count).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect();
    Ok((present, len))
}

// ---------------------------------------------------------------------------
// IntCodec
// ---------------------------------------------------------------------------

/// Nullable integers as zigzag delta varints.
///
/// Layout: presence bitmap, then for each present value the zigzag-encoded
/// difference from the previous present value (the first is relative to 0).
/// Dates and timestamps are stored through this codec as day or second
/// counts, so sorted columns shrink to one byte per row.
pub struct IntCodec;

impl ColumnCodec for IntCodec {
    type Item = Option<i64>;

    fn encode(items: &[Option<i64>], buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_presence(items, buf);
        let mut prev = 0i64;
        for v in items.iter().flatten() {
            encode_varint(zigzag_encode(v.wrapping_sub(prev)), buf);
            prev = *v;
        }
        Ok(())
    }

    fn decode(data: &[u8], count: usize) -> Result<(Vec<Option<i64>>, usize), CodecError> {
        let (present, mut pos) = decode_presence(data, count)?;
        let mut result = Vec::with_capacity(count);
        let mut prev = 0i64;
        for is_present in present {
            if !is_present {
                result.push(None);
                continue;
            }
            let (zz, consumed) = decode_varint(&data[pos..])?;
            pos += consumed;
            prev = prev.wrapping_add(zigzag_decode(zz));
            result.push(Some(prev));
        }
        Ok((result, pos))
    }
}

// ---------------------------------------------------------------------------
// FloatCodec
// ---------------------------------------------------------------------------

/// Nullable `f64` values as raw little-endian bits after the presence bitmap.
pub struct FloatCodec;

impl ColumnCodec for FloatCodec {
    type Item = Option<f64>;

    fn encode(items: &[Option<f64>], buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_presence(items, buf);
        for v in items.iter().flatten() {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    fn decode(data: &[u8], count: usize) -> Result<(Vec<Option<f64>>, usize), CodecError> {
        let (present, mut pos) = decode_presence(data, count)?;
        let mut result = Vec::with_capacity(count);
        for is_present in present {
            if is_present {
                let bits = read_u64(data, pos)?;
                pos += 8;
                result.push(Some(f64::from_bits(bits)));
            } else {
                result.push(None);
            }
        }
        Ok((result, pos))
    }
}

// ---------------------------------------------------------------------------
// DictStringCodec
// ---------------------------------------------------------------------------

/// Dictionary-encoded strings with run-length-encoded `u32` indices.
///
/// Channel names, campaign tags and refund flags have low cardinality, so
/// rows collapse to a handful of runs. Null is the index [`NULL_INDEX`].
///
/// Layout:
/// ```text
/// [table_count: u32 LE]
/// [len_0: u32 LE] [bytes_0...]
/// ...
/// [run_count: u32 LE]
/// [run_len_0: varint] [index_0: u32 LE]
/// ...
/// ```
pub struct DictStringCodec;

/// Index value reserved for null cells.
pub const NULL_INDEX: u32 = u32::MAX;

impl ColumnCodec for DictStringCodec {
    type Item = Option<String>;

    fn encode(items: &[Option<String>], buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut table: Vec<&str> = Vec::new();
        let mut index_of: HashMap<&str, u32> = HashMap::new();
        let mut indices: Vec<u32> = Vec::with_capacity(items.len());

        for item in items {
            let idx = match item.as_deref() {
                None => NULL_INDEX,
                Some(s) => {
                    if let Some(&i) = index_of.get(s) {
                        i
                    } else {
                        let i = len_u32(table.len(), "string table")?;
                        if i == NULL_INDEX {
                            return Err(CodecError::DataCorrupted("string table full".into()));
                        }
                        table.push(s);
                        index_of.insert(s, i);
                        i
                    }
                }
            };
            indices.push(idx);
        }

        buf.extend_from_slice(&len_u32(table.len(), "string table")?.to_le_bytes());
        for s in &table {
            buf.extend_from_slice(&len_u32(s.len(), "string")?.to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }

        let runs = rle_encode_u32(&indices);
        buf.extend_from_slice(&len_u32(runs.len(), "run count")?.to_le_bytes());
        for (run_len, idx) in runs {
            encode_varint(run_len, buf);
            buf.extend_from_slice(&idx.to_le_bytes());
        }
        Ok(())
    }

    fn decode(data: &[u8], count: usize) -> Result<(Vec<Option<String>>, usize), CodecError> {
        let mut pos = 0;
        let table_count = read_u32(data, pos)? as usize;
        pos += 4;

        let mut table: Vec<String> = Vec::with_capacity(table_count.min(count));
        for _ in 0..table_count {
            let len = read_u32(data, pos)? as usize;
            pos += 4;
            let bytes = data.get(pos..pos + len).ok_or(CodecError::UnexpectedEof)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| CodecError::DataCorrupted(format!("invalid UTF-8 in string: {e}")))?;
            table.push(s.to_string());
            pos += len;
        }

        let run_count = read_u32(data, pos)? as usize;
        pos += 4;

        let mut result: Vec<Option<String>> = Vec::with_capacity(count);
        for _ in 0..run_count {
            let (run_len, consumed) = decode_varint(&data[pos..])?;
            pos += consumed;
            let idx = read_u32(data, pos)?;
            pos += 4;
            let run_len = usize::try_from(run_len)
                .map_err(|_| CodecError::DataCorrupted("run length overflow".into()))?;
            if result.len() + run_len > count {
                return Err(CodecError::DataCorrupted(format!(
                    "runs exceed row count {count}"
                )));
            }
            let value = if idx == NULL_INDEX {
                None
            } else {
                let s = table.get(idx as usize).ok_or_else(|| {
                    CodecError::DataCorrupted(format!("string index {idx} out of range"))
                })?;
                Some(s.clone())
            };
            result.extend(std::iter::repeat_n(value, run_len));
        }

        if result.len() != count {
            return Err(CodecError::DataCorrupted(format!(
                "expected {count} items, got {}",
                result.len()
            )));
        }
        Ok((result, pos))
    }
}

/// Run-length encode a `u32` slice into `(run_length, value)` pairs.
fn rle_encode_u32(items: &[u32]) -> Vec<(u64, u32)> {
    let mut runs: Vec<(u64, u32)> = Vec::new();
    let Some((&first, rest)) = items.split_first() else {
        return runs;
    };
    let mut current = first;
    let mut count: u64 = 1;
    for &item in rest {
        if item == current {
            count += 1;
        } else {
            runs.push((count, current));
            current = item;
            count = 1;
        }
    }
    runs.push((count, current));
    runs
}

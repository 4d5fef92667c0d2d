//! Binary columnar file format (`.stx`).
//!
//! Partition files and the per-code counter table are stored in this format.
//! A file is self-describing: the schema block names every column and its
//! type, so readers look columns up by name and tolerate added or removed
//! columns.
//!
//! # Layout
//!
//! ```text
//! [header: 32 bytes]
//! [schema: per column (name_len: u16 LE, name bytes, type tag: u8)]
//! [offsets: u64 LE per column, absolute]
//! [column payloads...]
//! ```
//!
//! The header CRC covers every byte after the header.
//!
//! # Module layout
//!
//! - [`codec`]: the [`ColumnCodec`] trait and per-type codecs.
//! - [`columns`]: the [`ColumnSet`] intermediate representation.

pub mod codec;
pub mod columns;

pub use codec::{ColumnCodec, DictStringCodec, FloatCodec, IntCodec};
pub use columns::{Column, ColumnData, ColumnSet};

use crate::schema::ColumnType;
use codec::read_u64;

/// The four magic bytes at the start of every `.stx` file.
pub const STX_MAGIC: [u8; 4] = *b"STXC";

/// The current format version written to new files.
pub const STX_VERSION: u8 = 1;

/// File extension for columnar files.
pub const STX_EXTENSION: &str = "stx";

/// File header size in bytes (fixed).
///
/// Layout:
/// - 4 bytes: magic
/// - 1 byte:  version
/// - 1 byte:  column_count
/// - 2 bytes: reserved (must be zero)
/// - 8 bytes: row_count
/// - 8 bytes: created_at_us
/// - 8 bytes: data_crc64
/// = 32 bytes total
pub const HEADER_SIZE: usize = 32;

/// Errors returned by columnar encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid magic bytes: expected STXC, got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported format version {0}: maximum supported is {STX_VERSION}")]
    UnsupportedVersion(u8),

    #[error("data is corrupted: {0}")]
    DataCorrupted(String),

    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("unknown column type tag {0}")]
    UnknownColumnType(u8),

    #[error("column {column} has {actual} rows, expected {expected}")]
    ColumnLengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("too many columns: {0} (maximum 255)")]
    TooManyColumns(usize),
}

/// CRC-64/XZ (ECMA-182 polynomial, reflected input/output).
fn checksum(data: &[u8]) -> u64 {
    const POLY: u64 = 0xC96C_5795_D787_0F42;
    let mut crc: u64 = u64::MAX;
    for &byte in data {
        crc ^= u64::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Decoded file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u8,
    pub column_count: u8,
    pub row_count: u64,
    /// Wall-clock time at write (µs since Unix epoch).
    pub created_at_us: u64,
    pub data_crc64: u64,
}

/// Current wall-clock time in microseconds since the Unix epoch.
#[must_use]
pub fn now_us() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}

/// Encode a column set into `.stx` bytes.
///
/// # Errors
///
/// Returns [`CodecError`] if the set has more than 255 columns, a name longer
/// than 65535 bytes, or a column fails to encode.
pub fn encode(set: &ColumnSet, created_at_us: u64) -> Result<Vec<u8>, CodecError> {
    let columns = set.columns();
    let column_count =
        u8::try_from(columns.len()).map_err(|_| CodecError::TooManyColumns(columns.len()))?;

    let mut schema = Vec::new();
    for column in columns {
        let len = u16::try_from(column.name.len())
            .map_err(|_| CodecError::DataCorrupted("column name too long".into()))?;
        schema.extend_from_slice(&len.to_le_bytes());
        schema.extend_from_slice(column.name.as_bytes());
        schema.push(column.data.column_type().tag());
    }

    let mut col_bufs: Vec<Vec<u8>> = Vec::with_capacity(columns.len());
    for column in columns {
        let mut buf = Vec::new();
        column.data.encode(&mut buf)?;
        col_bufs.push(buf);
    }

    let data_start = HEADER_SIZE + schema.len() + columns.len() * 8;
    let mut body = Vec::with_capacity(data_start - HEADER_SIZE);
    body.extend_from_slice(&schema);
    let mut cur = data_start as u64;
    for buf in &col_bufs {
        body.extend_from_slice(&cur.to_le_bytes());
        cur += buf.len() as u64;
    }
    for buf in &col_bufs {
        body.extend_from_slice(buf);
    }

    let header = FileHeader {
        version: STX_VERSION,
        column_count,
        row_count: set.row_count() as u64,
        created_at_us,
        data_crc64: checksum(&body),
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&STX_MAGIC);
    out.push(header.version);
    out.push(header.column_count);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&header.row_count.to_le_bytes());
    out.extend_from_slice(&header.created_at_us.to_le_bytes());
    out.extend_from_slice(&header.data_crc64.to_le_bytes());
    debug_assert_eq!(out.len(), HEADER_SIZE);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode `.stx` bytes.
///
/// # Errors
///
/// Returns [`CodecError`] if:
/// - The magic bytes are wrong.
/// - The version is unsupported.
/// - The CRC does not match.
/// - Any column is truncated or malformed.
pub fn decode(data: &[u8]) -> Result<(FileHeader, ColumnSet), CodecError> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::UnexpectedEof);
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&data[0..4]);
    if magic != STX_MAGIC {
        return Err(CodecError::InvalidMagic(magic));
    }

    let version = data[4];
    if version > STX_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let column_count = data[5];
    let row_count = read_u64(data, 8)?;
    let created_at_us = read_u64(data, 16)?;
    let stored_crc = read_u64(data, 24)?;

    let actual_crc = checksum(&data[HEADER_SIZE..]);
    if actual_crc != stored_crc {
        return Err(CodecError::DataCorrupted(format!(
            "CRC mismatch: expected {stored_crc:#018x}, got {actual_crc:#018x}"
        )));
    }

    let mut pos = HEADER_SIZE;
    let mut schema: Vec<(String, ColumnType)> = Vec::with_capacity(column_count.into());
    for _ in 0..column_count {
        let len_bytes = data.get(pos..pos + 2).ok_or(CodecError::UnexpectedEof)?;
        let len = usize::from(u16::from_le_bytes([len_bytes[0], len_bytes[1]]));
        pos += 2;
        let name_bytes = data.get(pos..pos + len).ok_or(CodecError::UnexpectedEof)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|e| CodecError::DataCorrupted(format!("invalid column name: {e}")))?
            .to_string();
        pos += len;
        let tag = *data.get(pos).ok_or(CodecError::UnexpectedEof)?;
        pos += 1;
        let ty = ColumnType::from_tag(tag).ok_or(CodecError::UnknownColumnType(tag))?;
        schema.push((name, ty));
    }

    let mut offsets: Vec<usize> = Vec::with_capacity(schema.len());
    for _ in 0..schema.len() {
        let offset = usize::try_from(read_u64(data, pos)?)
            .map_err(|_| CodecError::DataCorrupted("offset overflow".into()))?;
        offsets.push(offset);
        pos += 8;
    }

    let count = usize::try_from(row_count)
        .map_err(|_| CodecError::DataCorrupted("row count overflow".into()))?;

    let mut columns = Vec::with_capacity(schema.len());
    for (i, (name, ty)) in schema.into_iter().enumerate() {
        let start = offsets[i];
        let end = offsets.get(i + 1).copied().unwrap_or(data.len());
        if start < pos || start > end || end > data.len() {
            return Err(CodecError::DataCorrupted(format!(
                "column {name} has invalid bounds {start}..{end}"
            )));
        }
        let column = ColumnData::decode(ty, &data[start..end], count)?;
        columns.push(Column { name, data: column });
    }

    let header = FileHeader {
        version,
        column_count,
        row_count,
        created_at_us,
        data_crc64: stored_crc,
    };
    Ok((header, ColumnSet::from_columns(count, columns)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use chrono::NaiveDateTime;

    fn sample() -> ColumnSet {
        let mut set = ColumnSet::new(&[
            ("cpc", ColumnType::Int),
            ("rev", ColumnType::Float),
            ("channel_act", ColumnType::Text),
            ("trans_date", ColumnType::DateTime),
        ]);
        for i in 0..50i64 {
            set.push_row(|name| match name {
                "cpc" => Value::Int(500 + i % 3),
                #[allow(clippy::cast_precision_loss)]
                "rev" if i % 4 != 0 => Value::Float(i as f64 * 0.5),
                "channel_act" if i % 5 == 0 => Value::Text("UPGRADE".into()),
                "channel_act" => Value::Text("WEB".into()),
                "trans_date" => Value::DateTime(
                    NaiveDateTime::parse_from_str("2024-03-05 10:00:00", "%Y-%m-%d %H:%M:%S")
                        .unwrap()
                        + chrono::Duration::minutes(i),
                ),
                _ => Value::Null,
            });
        }
        set
    }

    #[test]
    fn checksum_matches_crc64_xz_check_value() {
        assert_eq!(checksum(b"123456789"), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn encode_decode_preserves_set() {
        let set = sample();
        let bytes = encode(&set, 42).unwrap();
        assert_eq!(&bytes[0..4], b"STXC");
        let (header, decoded) = decode(&bytes).unwrap();
        assert_eq!(header.row_count, 50);
        assert_eq!(header.column_count, 4);
        assert_eq!(header.created_at_us, 42);
        assert_eq!(decoded, set);
    }

    #[test]
    fn empty_set_keeps_its_schema() {
        let set = ColumnSet::new(&[("date", ColumnType::Date), ("cpc", ColumnType::Int)]);
        let (_, decoded) = decode(&encode(&set, 0).unwrap()).unwrap();
        assert_eq!(decoded.row_count(), 0);
        assert_eq!(decoded.names(), vec!["date", "cpc"]);
    }

    #[test]
    fn flipped_byte_fails_crc() {
        let mut bytes = encode(&sample(), 0).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(CodecError::DataCorrupted(_))));
    }

    #[test]
    fn wrong_magic_and_future_version_are_rejected() {
        let mut bytes = encode(&sample(), 0).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(CodecError::InvalidMagic(_))));

        let mut bytes = encode(&sample(), 0).unwrap();
        bytes[4] = STX_VERSION + 1;
        assert!(matches!(decode(&bytes), Err(CodecError::UnsupportedVersion(_))));
    }

    #[test]
    fn truncated_file_is_an_error() {
        let bytes = encode(&sample(), 0).unwrap();
        assert!(decode(&bytes[..HEADER_SIZE - 1]).is_err());
        assert!(decode(&bytes[..bytes.len() / 2]).is_err());
    }
}

//! Per-code daily counters.
//!
//! The per-code table is a derived cache of the store keyed by
//! `(date, cpc)`. [`build::build_day`] computes one date, [`merge::merge`]
//! replaces that date in the historical table, and [`write_code_table`]
//! publishes the result atomically. Losing the table is recoverable by
//! rebuilding every store date.

pub mod build;
pub mod merge;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info};

use crate::atomic::{self, AtomicWriteError};
use crate::columnar::{self, CodecError, ColumnSet};
use crate::error::ErrorCode;
use crate::record::Value;
use crate::schema::ColumnType;

pub use build::{DayTally, build_day, tally};
pub use merge::merge;

/// File name of the per-code historical table.
pub const CODE_TABLE_FILE: &str = "counters_code.stx";
/// File name of the per-service daily table.
pub const SERVICE_TABLE_FILE: &str = "counters_service.csv";

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("failed to read counter table {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("corrupt counter table {path}: {source}")]
    Corrupt { path: PathBuf, source: CodecError },

    #[error("counter table {path} has no '{column}' column")]
    MissingKeyColumn { path: PathBuf, column: &'static str },

    #[error("failed to encode counter table: {0}")]
    Encode(CodecError),

    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

impl CounterError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } | Self::Corrupt { .. } | Self::MissingKeyColumn { .. } => {
                ErrorCode::CorruptCounterTable
            }
            Self::Encode(_) => ErrorCode::InternalUnexpected,
            Self::Write(_) => ErrorCode::AtomicWriteFailed,
        }
    }
}

/// Locations of the two published counter tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterPaths {
    pub code_table: PathBuf,
    pub service_table: PathBuf,
}

impl CounterPaths {
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            code_table: dir.join(CODE_TABLE_FILE),
            service_table: dir.join(SERVICE_TABLE_FILE),
        }
    }
}

/// Aggregates for one `(date, cpc)`.
///
/// `act_free + act_pay == act_count` and `upg_count <= act_count`;
/// `upg_dct_count <= dct_count`. Money fields are rounded to cents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCounterRow {
    pub date: NaiveDate,
    pub cpc: i64,
    pub act_count: i64,
    pub act_free: i64,
    pub act_pay: i64,
    pub upg_count: i64,
    pub reno_count: i64,
    pub dct_count: i64,
    pub upg_dct_count: i64,
    pub cnr_count: i64,
    pub ppd_count: i64,
    pub rfnd_count: i64,
    pub rfnd_amount: f64,
    pub rev: f64,
    pub last_updated: NaiveDateTime,
}

impl DailyCounterRow {
    /// An all-zero row for `(date, cpc)`.
    #[must_use]
    pub fn zero(date: NaiveDate, cpc: i64) -> Self {
        Self {
            date,
            cpc,
            act_count: 0,
            act_free: 0,
            act_pay: 0,
            upg_count: 0,
            reno_count: 0,
            dct_count: 0,
            upg_dct_count: 0,
            cnr_count: 0,
            ppd_count: 0,
            rfnd_count: 0,
            rfnd_amount: 0.0,
            rev: 0.0,
            last_updated: zero_timestamp(),
        }
    }

    fn int_value(&self, column: &str) -> Option<i64> {
        Some(match column {
            "cpc" => self.cpc,
            "act_count" => self.act_count,
            "act_free" => self.act_free,
            "act_pay" => self.act_pay,
            "upg_count" => self.upg_count,
            "reno_count" => self.reno_count,
            "dct_count" => self.dct_count,
            "upg_dct_count" => self.upg_dct_count,
            "cnr_count" => self.cnr_count,
            "ppd_count" => self.ppd_count,
            "rfnd_count" => self.rfnd_count,
            _ => return None,
        })
    }

    fn value(&self, column: &str) -> Value {
        match column {
            "date" => Value::Date(self.date),
            "rfnd_amount" => Value::Float(self.rfnd_amount),
            "rev" => Value::Float(self.rev),
            "last_updated" => Value::DateTime(self.last_updated),
            other => self.int_value(other).map_or(Value::Null, Value::Int),
        }
    }
}

/// Timestamp given to rows that predate the `last_updated` column.
#[must_use]
pub fn zero_timestamp() -> NaiveDateTime {
    NaiveDateTime::default()
}

/// Round to two decimal places.
#[must_use]
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Count columns, in table order.
pub const COUNT_COLUMNS: [&str; 10] = [
    "act_count",
    "act_free",
    "act_pay",
    "upg_count",
    "reno_count",
    "dct_count",
    "upg_dct_count",
    "cnr_count",
    "ppd_count",
    "rfnd_count",
];

/// Full per-code table layout.
#[must_use]
pub fn code_table_layout() -> Vec<(&'static str, ColumnType)> {
    let mut layout = vec![("date", ColumnType::Date), ("cpc", ColumnType::Int)];
    layout.extend(COUNT_COLUMNS.iter().map(|c| (*c, ColumnType::Int)));
    layout.push(("rfnd_amount", ColumnType::Float));
    layout.push(("rev", ColumnType::Float));
    layout.push(("last_updated", ColumnType::DateTime));
    layout
}

/// Convert rows to the columnar layout.
#[must_use]
pub fn rows_to_columns(rows: &[DailyCounterRow]) -> ColumnSet {
    let mut set = ColumnSet::with_capacity(&code_table_layout(), rows.len());
    for row in rows {
        set.push_row(|name| row.value(name));
    }
    set
}

/// Read rows back from a column set. Columns added after a table was
/// first written are absent from old files; they read as zero, and a missing
/// `last_updated` reads as [`zero_timestamp`]. Rows without a date or code
/// are skipped.
#[must_use]
pub fn columns_to_rows(set: &ColumnSet) -> Vec<DailyCounterRow> {
    let int = |name: &str, row: usize| set.value(name, row).as_int().unwrap_or(0);
    let money = |name: &str, row: usize| round_cents(set.value(name, row).as_float().unwrap_or(0.0));

    let mut rows = Vec::with_capacity(set.row_count());
    for row in 0..set.row_count() {
        let (Some(date), Some(cpc)) = (
            set.value("date", row).as_date(),
            set.value("cpc", row).as_int(),
        ) else {
            continue;
        };
        rows.push(DailyCounterRow {
            date,
            cpc,
            act_count: int("act_count", row),
            act_free: int("act_free", row),
            act_pay: int("act_pay", row),
            upg_count: int("upg_count", row),
            reno_count: int("reno_count", row),
            dct_count: int("dct_count", row),
            upg_dct_count: int("upg_dct_count", row),
            cnr_count: int("cnr_count", row),
            ppd_count: int("ppd_count", row),
            rfnd_count: int("rfnd_count", row),
            rfnd_amount: money("rfnd_amount", row),
            rev: money("rev", row),
            last_updated: set
                .value("last_updated", row)
                .as_datetime()
                .unwrap_or_else(zero_timestamp),
        });
    }
    rows
}

/// Load the per-code table. A missing file is an empty table.
///
/// # Errors
///
/// Returns [`CounterError`] if the file exists but cannot be read, fails
/// to decode, or lacks the `date`/`cpc` key columns.
pub fn load_code_table(path: &Path) -> Result<Vec<DailyCounterRow>, CounterError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(CounterError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let (_, set) = columnar::decode(&bytes).map_err(|source| CounterError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    for column in ["date", "cpc"] {
        if set.column(column).is_none() && set.row_count() > 0 {
            return Err(CounterError::MissingKeyColumn {
                path: path.to_path_buf(),
                column,
            });
        }
    }
    let backfilled: Vec<&str> = code_table_layout()
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| set.column(name).is_none())
        .collect();
    if !backfilled.is_empty() {
        debug!(path = %path.display(), columns = ?backfilled, "backfilling absent counter columns");
    }
    Ok(columns_to_rows(&set))
}

/// Publish the per-code table atomically.
///
/// # Errors
///
/// Returns [`CounterError`] if encoding or the atomic write fails. The
/// previous table stays in place on failure.
pub fn write_code_table(path: &Path, rows: &[DailyCounterRow]) -> Result<(), CounterError> {
    let bytes = columnar::encode(&rows_to_columns(rows), columnar::now_us())
        .map_err(CounterError::Encode)?;
    atomic::write_atomic(path, &bytes)?;
    info!(path = %path.display(), rows = rows.len(), "wrote per-code counters");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, n).unwrap()
    }

    #[test]
    fn missing_table_loads_empty() {
        let dir = TempDir::new().unwrap();
        let rows = load_code_table(&dir.path().join(CODE_TABLE_FILE)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn table_survives_write_and_load() {
        let dir = TempDir::new().unwrap();
        let path = CounterPaths::in_dir(dir.path()).code_table;
        let mut row = DailyCounterRow::zero(day(3), 500);
        row.act_count = 3;
        row.act_pay = 2;
        row.act_free = 1;
        row.rev = 3.98;
        row.last_updated = NaiveDateTime::parse_from_str("2024-01-04 06:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        write_code_table(&path, std::slice::from_ref(&row)).unwrap();
        assert_eq!(load_code_table(&path).unwrap(), vec![row]);
    }

    #[test]
    fn old_table_without_newer_columns_backfills_zeros() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CODE_TABLE_FILE);
        let mut set = ColumnSet::new(&[
            ("date", ColumnType::Date),
            ("cpc", ColumnType::Int),
            ("act_count", ColumnType::Int),
            ("rfnd_count", ColumnType::Int),
        ]);
        set.push_row(|name| match name {
            "date" => Value::Date(day(1)),
            "cpc" => Value::Int(42),
            "act_count" => Value::Int(5),
            _ => Value::Int(1),
        });
        atomic::write_atomic(&path, &columnar::encode(&set, 0).unwrap()).unwrap();

        let rows = load_code_table(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].act_count, 5);
        assert_eq!(rows[0].rfnd_count, 1);
        assert_eq!(rows[0].act_free, 0);
        assert_eq!(rows[0].upg_dct_count, 0);
        assert!(rows[0].rev.abs() < f64::EPSILON);
        assert_eq!(rows[0].last_updated, zero_timestamp());
    }

    #[test]
    fn corrupt_table_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CODE_TABLE_FILE);
        fs::write(&path, b"not a table").unwrap();
        let err = load_code_table(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptCounterTable);
    }

    #[test]
    fn rounding_is_to_cents() {
        assert!((round_cents(1.005_000_1) - 1.01).abs() < 1e-9);
        assert!((round_cents(0.1 + 0.2) - 0.3).abs() < 1e-9);
    }
}

//! Raw row to typed record conversion.
//!
//! Everything here is pure. Unparseable cells degrade to null; a row is only
//! dropped when its primary date is null, because it cannot be partitioned.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::record::{TransactionRecord, Value};
use crate::schema::{ColumnType, Field, Kind};

/// Cell contents treated as null.
pub const NULL_TOKENS: [&str; 3] = ["", "NULL", "null"];

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Maps raw column positions to schema fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    positions: Vec<Option<Field>>,
    positional: bool,
}

impl ColumnLayout {
    /// Match a header row against `kind`'s schema by name. When no header
    /// cell names a schema field, fall back to schema order.
    #[must_use]
    pub fn from_header<S: AsRef<str>>(kind: Kind, header: &[S]) -> Self {
        let positions: Vec<Option<Field>> = header
            .iter()
            .map(|h| Field::from_name(strip_bom(h.as_ref())).filter(|f| kind.has_field(*f)))
            .collect();
        if positions.iter().all(Option::is_none) {
            return Self::positional(kind);
        }
        Self {
            positions,
            positional: false,
        }
    }

    /// Schema-order layout for headerless or renamed files.
    #[must_use]
    pub fn positional(kind: Kind) -> Self {
        Self {
            positions: kind.fields().iter().copied().map(Some).collect(),
            positional: true,
        }
    }

    #[must_use]
    pub const fn is_positional(&self) -> bool {
        self.positional
    }

    /// Schema fields that no raw column supplies.
    #[must_use]
    pub fn missing_fields(&self, kind: Kind) -> Vec<Field> {
        kind.fields()
            .iter()
            .copied()
            .filter(|f| !self.positions.contains(&Some(*f)))
            .collect()
    }

    fn position_of(&self, field: Field) -> Option<usize> {
        self.positions.iter().position(|p| *p == Some(field))
    }
}

fn strip_bom(s: &str) -> &str {
    s.strip_prefix('\u{feff}').unwrap_or(s)
}

/// Parse `%Y-%m-%d %H:%M:%S`, falling back to `%Y-%m-%d` at midnight.
#[must_use]
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.contains(' ') {
        NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT).ok()
    } else {
        NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .ok()
            .map(|d| d.and_time(NaiveTime::MIN))
    }
}

fn parse_int(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    // Spreadsheet exports write integer columns as `123.0`.
    let whole = raw.strip_suffix(".0")?;
    whole.parse::<i64>().ok()
}

fn parse_float(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a single raw cell according to `field`'s column type.
#[must_use]
pub fn parse_cell(field: Field, raw: &str) -> Value {
    if NULL_TOKENS.contains(&raw.trim()) {
        return Value::Null;
    }
    let parsed = match field.column_type() {
        ColumnType::Int => parse_int(raw).map(Value::Int),
        ColumnType::Float => parse_float(raw).map(Value::Float),
        ColumnType::Text => Some(Value::Text(raw.trim().to_string())),
        ColumnType::DateTime => parse_datetime(raw).map(Value::DateTime),
        ColumnType::Date => NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
            .ok()
            .map(Value::Date),
    };
    parsed.unwrap_or(Value::Null)
}

/// Convert one raw row into a record of `kind`. Short rows are padded with
/// nulls. Returns `None` when the primary date is missing or unparseable.
#[must_use]
pub fn normalize_row<S: AsRef<str>>(
    kind: Kind,
    layout: &ColumnLayout,
    row: &[S],
) -> Option<TransactionRecord> {
    TransactionRecord::from_fields(kind, |field| {
        layout
            .position_of(field)
            .and_then(|i| row.get(i))
            .map_or(Value::Null, |raw| parse_cell(field, raw.as_ref()))
    })
}

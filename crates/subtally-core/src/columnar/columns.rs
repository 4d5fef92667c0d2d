//! Self-describing in-memory column sets.
//!
//! A [`ColumnSet`] is the intermediate representation between typed rows
//! (transaction records, counter rows) and the `.stx` byte layout. Columns
//! carry their own name and type, so readers can look columns up by name and
//! treat a missing column as all-null.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};

use super::CodecError;
use super::codec::{ColumnCodec, DictStringCodec, FloatCodec, IntCodec};
use crate::record::Value;
use crate::schema::ColumnType;

/// Typed storage for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
    DateTime(Vec<Option<NaiveDateTime>>),
    Date(Vec<Option<NaiveDate>>),
}

impl ColumnData {
    #[must_use]
    pub fn with_capacity(ty: ColumnType, capacity: usize) -> Self {
        match ty {
            ColumnType::Int => Self::Int(Vec::with_capacity(capacity)),
            ColumnType::Float => Self::Float(Vec::with_capacity(capacity)),
            ColumnType::Text => Self::Text(Vec::with_capacity(capacity)),
            ColumnType::DateTime => Self::DateTime(Vec::with_capacity(capacity)),
            ColumnType::Date => Self::Date(Vec::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub const fn column_type(&self) -> ColumnType {
        match self {
            Self::Int(_) => ColumnType::Int,
            Self::Float(_) => ColumnType::Float,
            Self::Text(_) => ColumnType::Text,
            Self::DateTime(_) => ColumnType::DateTime,
            Self::Date(_) => ColumnType::Date,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
            Self::DateTime(v) => v.len(),
            Self::Date(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value, coercing to this column's type. Values that do not
    /// fit the type are stored as null.
    pub fn push(&mut self, value: &Value) {
        match self {
            Self::Int(v) => v.push(value.as_int()),
            Self::Float(v) => v.push(value.as_float()),
            Self::Text(v) => v.push(value.as_text().map(str::to_string)),
            Self::DateTime(v) => v.push(value.as_datetime()),
            Self::Date(v) => v.push(value.as_date()),
        }
    }

    /// Value at `row`, or `Null` when out of range.
    #[must_use]
    pub fn get(&self, row: usize) -> Value {
        let cell = match self {
            Self::Int(v) => v.get(row).copied().flatten().map(Value::Int),
            Self::Float(v) => v.get(row).copied().flatten().map(Value::Float),
            Self::Text(v) => v.get(row).cloned().flatten().map(Value::Text),
            Self::DateTime(v) => v.get(row).copied().flatten().map(Value::DateTime),
            Self::Date(v) => v.get(row).copied().flatten().map(Value::Date),
        };
        cell.unwrap_or(Value::Null)
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Self::Int(v) => IntCodec::encode(v, buf),
            Self::Float(v) => FloatCodec::encode(v, buf),
            Self::Text(v) => DictStringCodec::encode(v, buf),
            Self::DateTime(v) => {
                let secs: Vec<Option<i64>> = v
                    .iter()
                    .map(|d| d.map(|d| d.and_utc().timestamp()))
                    .collect();
                IntCodec::encode(&secs, buf)
            }
            Self::Date(v) => {
                let days: Vec<Option<i64>> = v
                    .iter()
                    .map(|d| d.map(|d| i64::from(d.num_days_from_ce())))
                    .collect();
                IntCodec::encode(&days, buf)
            }
        }
    }

    pub(crate) fn decode(ty: ColumnType, data: &[u8], count: usize) -> Result<Self, CodecError> {
        let column = match ty {
            ColumnType::Int => Self::Int(IntCodec::decode(data, count)?.0),
            ColumnType::Float => Self::Float(FloatCodec::decode(data, count)?.0),
            ColumnType::Text => Self::Text(DictStringCodec::decode(data, count)?.0),
            ColumnType::DateTime => {
                let (secs, _) = IntCodec::decode(data, count)?;
                let values = secs
                    .into_iter()
                    .map(|s| {
                        s.map(|s| {
                            DateTime::from_timestamp(s, 0)
                                .map(|d| d.naive_utc())
                                .ok_or_else(|| {
                                    CodecError::DataCorrupted(format!("timestamp {s} out of range"))
                                })
                        })
                        .transpose()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::DateTime(values)
            }
            ColumnType::Date => {
                let (days, _) = IntCodec::decode(data, count)?;
                let values = days
                    .into_iter()
                    .map(|d| {
                        d.map(|d| {
                            i32::try_from(d)
                                .ok()
                                .and_then(NaiveDate::from_num_days_from_ce_opt)
                                .ok_or_else(|| {
                                    CodecError::DataCorrupted(format!("day number {d} out of range"))
                                })
                        })
                        .transpose()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::Date(values)
            }
        };
        Ok(column)
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// An ordered set of equally long, named columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColumnSet {
    row_count: usize,
    columns: Vec<Column>,
}

impl ColumnSet {
    /// Empty set with the given column layout.
    #[must_use]
    pub fn new<S: AsRef<str>>(layout: &[(S, ColumnType)]) -> Self {
        Self::with_capacity(layout, 0)
    }

    #[must_use]
    pub fn with_capacity<S: AsRef<str>>(layout: &[(S, ColumnType)], capacity: usize) -> Self {
        Self {
            row_count: 0,
            columns: layout
                .iter()
                .map(|(name, ty)| Column {
                    name: name.as_ref().to_string(),
                    data: ColumnData::with_capacity(*ty, capacity),
                })
                .collect(),
        }
    }

    /// Assemble a set from already-built columns.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ColumnLengthMismatch`] if columns differ in length.
    pub fn from_columns(row_count: usize, columns: Vec<Column>) -> Result<Self, CodecError> {
        if let Some(bad) = columns.iter().find(|c| c.data.len() != row_count) {
            return Err(CodecError::ColumnLengthMismatch {
                column: bad.name.clone(),
                expected: row_count,
                actual: bad.data.len(),
            });
        }
        Ok(Self { row_count, columns })
    }

    /// Append one row. `value_of` is called once per column, in order.
    pub fn push_row(&mut self, mut value_of: impl FnMut(&str) -> Value) {
        for column in &mut self.columns {
            let value = value_of(&column.name);
            column.data.push(&value);
        }
        self.row_count += 1;
    }

    #[must_use]
    pub const fn row_count(&self) -> usize {
        self.row_count
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Cell at (`name`, `row`). Missing columns read as null.
    #[must_use]
    pub fn value(&self, name: &str, row: usize) -> Value {
        self.column(name).map_or(Value::Null, |c| c.data.get(row))
    }
}

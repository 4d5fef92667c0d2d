//! Month-partitioned columnar transaction store.
//!
//! Layout: `<root>/<kind dir>/year_month=YYYY-MM/part-000000.stx`.
//!
//! A partition is never modified in place. [`PartitionStore::ingest`] reads
//! the touched months, appends the new records, deduplicates by natural key
//! keeping the later arrival, and rewrites each month wholesale. The rewrite
//! publishes the canonical part file through the atomic writer, then deletes
//! any other part files of that month. A crash between those two steps can
//! leave an extra file whose rows duplicate the canonical one; the next
//! ingest of that month folds them away again.
//!
//! Because every natural key contains the kind's primary date, two records
//! with the same key always share a partition, so reading only the touched
//! months is enough to deduplicate.

pub mod partition;
pub mod validate;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::atomic::{self, AtomicWriteError};
use crate::columnar::{self, CodecError, Column, ColumnData, ColumnSet, STX_EXTENSION};
use crate::error::ErrorCode;
use crate::record::TransactionRecord;
use crate::schema::Kind;

pub use partition::{PARTITION_PREFIX, PartitionedRecord, ReadFilter, YearMonth};
pub use validate::{KindValidation, PartitionSummary};

/// File name every partition rewrite publishes.
pub const PART_FILE: &str = "part-000000.stx";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("corrupt partition file {path}: {source}")]
    Corrupt { path: PathBuf, source: CodecError },

    #[error("partition file {path} has no `{column}` column")]
    MissingDateColumn { path: PathBuf, column: &'static str },

    #[error("partition file {path} holds {rows} rows but only {dated} have a primary date")]
    UndatedRows {
        path: PathBuf,
        rows: usize,
        dated: usize,
    },

    #[error("failed to encode partition {kind}/{partition}: {source}")]
    Encode {
        kind: Kind,
        partition: YearMonth,
        source: CodecError,
    },

    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } | Self::Encode { .. } => ErrorCode::PartitionWriteFailed,
            Self::Corrupt { .. } | Self::UndatedRows { .. } => ErrorCode::CorruptPartition,
            Self::MissingDateColumn { .. } => ErrorCode::SchemaDrift,
            Self::Write(_) => ErrorCode::AtomicWriteFailed,
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of rewriting one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionWrite {
    pub year_month: YearMonth,
    pub rows: usize,
    pub files_removed: usize,
}

/// Outcome of [`PartitionStore::ingest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub kind: Kind,
    pub records_in: usize,
    pub duplicates_removed: usize,
    pub partitions: Vec<PartitionWrite>,
}

/// Remove records sharing a natural key, keeping the last arrival. Survivors
/// keep their relative order. Returns the survivors and the number removed.
#[must_use]
pub fn dedup_last_wins(records: Vec<TransactionRecord>) -> (Vec<TransactionRecord>, usize) {
    let mut last_index = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        last_index.insert(record.natural_key(), i);
    }
    let before = records.len();
    let survivors: Vec<TransactionRecord> = records
        .into_iter()
        .enumerate()
        .filter(|(i, r)| last_index.get(&r.natural_key()) == Some(i))
        .map(|(_, r)| r)
        .collect();
    let removed = before - survivors.len();
    (survivors, removed)
}

/// Convert records of one kind into a column set in schema order.
///
/// # Errors
///
/// Returns [`CodecError::ColumnLengthMismatch`] if a column ends up with a
/// different length than `records`.
pub fn records_to_columns(
    kind: Kind,
    records: &[TransactionRecord],
) -> Result<ColumnSet, CodecError> {
    let columns = kind
        .fields()
        .iter()
        .map(|field| {
            let mut data = ColumnData::with_capacity(field.column_type(), records.len());
            for record in records {
                data.push(&record.get(*field));
            }
            Column {
                name: field.name().to_string(),
                data,
            }
        })
        .collect();
    ColumnSet::from_columns(records.len(), columns)
}

/// Convert a decoded column set back into records. Rows without a primary
/// date are skipped; [`PartitionStore::read_partition`] refuses such files.
#[must_use]
pub fn columns_to_records(kind: Kind, set: &ColumnSet) -> Vec<TransactionRecord> {
    (0..set.row_count())
        .filter_map(|row| TransactionRecord::from_fields(kind, |f| set.value(f.name(), row)))
        .collect()
}

/// Every row of `set` as a record, or an error if any row would be lost.
fn complete_records(
    kind: Kind,
    path: &Path,
    set: &ColumnSet,
) -> Result<Vec<TransactionRecord>, StoreError> {
    let column = kind.primary_date().name();
    if set.column(column).is_none() {
        return Err(StoreError::MissingDateColumn {
            path: path.to_path_buf(),
            column,
        });
    }
    let records = columns_to_records(kind, set);
    if records.len() < set.row_count() {
        return Err(StoreError::UndatedRows {
            path: path.to_path_buf(),
            rows: set.row_count(),
            dated: records.len(),
        });
    }
    Ok(records)
}

/// Handle on a store root directory.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
}

impl PartitionStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn kind_dir(&self, kind: Kind) -> PathBuf {
        self.root.join(kind.dir())
    }

    #[must_use]
    pub fn partition_dir(&self, kind: Kind, year_month: YearMonth) -> PathBuf {
        self.kind_dir(kind).join(year_month.dir_name())
    }

    /// Months that have a partition directory, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the kind directory exists but cannot be
    /// listed.
    pub fn partitions(&self, kind: Kind) -> Result<Vec<YearMonth>, StoreError> {
        let dir = self.kind_dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        let mut months: Vec<YearMonth> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().and_then(YearMonth::from_dir_name))
            .collect();
        months.sort_unstable();
        Ok(months)
    }

    /// Published part files of one partition, sorted. Temp files are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be listed.
    pub fn partition_files(
        &self,
        kind: Kind,
        year_month: YearMonth,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.partition_dir(kind, year_month);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && !atomic::is_temp_file(p))
            .filter(|p| p.extension().is_some_and(|ext| ext == STX_EXTENSION))
            .collect();
        files.sort();
        Ok(files)
    }

    fn read_set(path: &Path) -> Result<ColumnSet, StoreError> {
        let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
        let (_, set) = columnar::decode(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(set)
    }

    /// Every record in one partition, in file order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a part file cannot be read or decoded, lacks
    /// the primary date column, or has rows without a primary date.
    pub fn read_partition(
        &self,
        kind: Kind,
        year_month: YearMonth,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut records = Vec::new();
        for path in self.partition_files(kind, year_month)? {
            let set = Self::read_set(&path)?;
            records.extend(complete_records(kind, &path, &set)?);
        }
        Ok(records)
    }

    /// Records matching `filter`, each tagged with its partition month.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any admitted partition cannot be read.
    pub fn read(
        &self,
        kind: Kind,
        filter: &ReadFilter,
    ) -> Result<Vec<PartitionedRecord>, StoreError> {
        let mut out = Vec::new();
        for year_month in self.partitions(kind)? {
            if !filter.admits_month(year_month) {
                continue;
            }
            for record in self.read_partition(kind, year_month)? {
                if filter.admits_date(record.event_date()) {
                    out.push(PartitionedRecord { year_month, record });
                }
            }
        }
        Ok(out)
    }

    /// Records whose primary date is `date`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the partition cannot be read.
    pub fn read_date(
        &self,
        kind: Kind,
        date: NaiveDate,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        Ok(self
            .read(kind, &ReadFilter::date(date))?
            .into_iter()
            .map(|p| p.record)
            .collect())
    }

    /// Distinct primary dates present for `kind`. Only the primary date
    /// column is decoded into dates.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any partition cannot be read.
    pub fn dates(&self, kind: Kind) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let column = kind.primary_date().name();
        let mut dates = BTreeSet::new();
        for year_month in self.partitions(kind)? {
            for path in self.partition_files(kind, year_month)? {
                let set = Self::read_set(&path)?;
                if set.column(column).is_none() {
                    return Err(StoreError::MissingDateColumn { path, column });
                }
                for row in 0..set.row_count() {
                    if let Some(date) = set.value(column, row).as_date() {
                        dates.insert(date);
                    }
                }
            }
        }
        Ok(dates)
    }

    /// Earliest and latest primary dates, or `None` for an empty kind.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any partition cannot be read.
    pub fn range(&self, kind: Kind) -> Result<Option<(NaiveDate, NaiveDate)>, StoreError> {
        let dates = self.dates(kind)?;
        Ok(dates.first().copied().zip(dates.last().copied()))
    }

    /// Merge `new_records` into the store.
    ///
    /// Records of another kind are ignored. For each month touched by the new
    /// records the existing partition is read, the new records are appended,
    /// duplicates are removed keeping the later arrival, and the partition is
    /// rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on the first partition that cannot be read or
    /// written. Partitions already rewritten stay rewritten; a month whose
    /// existing rows cannot all be read is left untouched.
    pub fn ingest(
        &self,
        kind: Kind,
        new_records: Vec<TransactionRecord>,
    ) -> Result<IngestReport, StoreError> {
        let records_in = new_records.len();
        let mut by_month: BTreeMap<YearMonth, Vec<TransactionRecord>> = BTreeMap::new();
        let mut foreign = 0usize;
        for record in new_records {
            if record.kind() != kind {
                foreign += 1;
                continue;
            }
            by_month
                .entry(YearMonth::of(record.event_date()))
                .or_default()
                .push(record);
        }
        if foreign > 0 {
            warn!(kind = %kind, foreign, "ignored records of another kind");
        }

        let mut report = IngestReport {
            kind,
            records_in,
            duplicates_removed: 0,
            partitions: Vec::with_capacity(by_month.len()),
        };

        for (year_month, incoming) in by_month {
            let mut merged = self.read_partition(kind, year_month)?;
            let existing = merged.len();
            merged.extend(incoming);
            let (survivors, removed) = dedup_last_wins(merged);
            report.duplicates_removed += removed;
            debug!(
                kind = %kind,
                partition = %year_month,
                existing,
                removed,
                "merged partition"
            );
            let write = self.write_partition(kind, year_month, survivors)?;
            report.partitions.push(write);
        }

        info!(
            kind = %kind,
            records = records_in,
            duplicates = report.duplicates_removed,
            partitions = report.partitions.len(),
            "ingest complete"
        );
        Ok(report)
    }

    /// Replace a partition's contents with `records`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding, the atomic write, or removal of a
    /// superseded part file fails.
    pub fn write_partition(
        &self,
        kind: Kind,
        year_month: YearMonth,
        mut records: Vec<TransactionRecord>,
    ) -> Result<PartitionWrite, StoreError> {
        records.sort_by_key(TransactionRecord::event_time);
        let encode_error = |source| StoreError::Encode {
            kind,
            partition: year_month,
            source,
        };
        let set = records_to_columns(kind, &records).map_err(encode_error)?;
        let bytes = columnar::encode(&set, columnar::now_us()).map_err(encode_error)?;

        let previous = self.partition_files(kind, year_month)?;
        let target = self.partition_dir(kind, year_month).join(PART_FILE);
        atomic::write_atomic(&target, &bytes)?;

        let mut files_removed = 0;
        for path in previous.into_iter().filter(|p| *p != target) {
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            files_removed += 1;
        }

        info!(
            kind = %kind,
            partition = %year_month,
            rows = records.len(),
            files_removed,
            "partition rewritten"
        );
        Ok(PartitionWrite {
            year_month,
            rows: records.len(),
            files_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::{activation, refund, ts};
    use tempfile::TempDir;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn dedup_keeps_last_arrival_in_arrival_order() {
        let records = vec![
            activation("2024-03-01 10:00:00", 1, 500, 1.0),
            activation("2024-03-01 11:00:00", 2, 500, 2.0),
            activation("2024-03-01 10:00:00", 1, 500, 3.0),
        ];
        let (survivors, removed) = dedup_last_wins(records);
        assert_eq!(removed, 1);
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].rev(), Some(2.0));
        assert_eq!(survivors[1].rev(), Some(3.0));
    }

    #[test]
    fn ingest_creates_month_partitions() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let report = store
            .ingest(
                Kind::Activation,
                vec![
                    activation("2024-02-28 10:00:00", 1, 500, 1.0),
                    activation("2024-03-01 10:00:00", 2, 500, 1.0),
                ],
            )
            .unwrap();
        assert_eq!(report.partitions.len(), 2);
        assert_eq!(
            store.partitions(Kind::Activation).unwrap(),
            vec![YearMonth::new(2024, 2).unwrap(), YearMonth::new(2024, 3).unwrap()]
        );
        assert!(
            dir.path()
                .join("act/year_month=2024-03/part-000000.stx")
                .is_file()
        );
        assert_eq!(
            store.range(Kind::Activation).unwrap(),
            Some((d("2024-02-28"), d("2024-03-01")))
        );
    }

    #[test]
    fn reingest_replaces_rather_than_appends() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        store
            .ingest(Kind::Activation, vec![activation("2024-03-01 10:00:00", 1, 500, 1.0)])
            .unwrap();
        let report = store
            .ingest(
                Kind::Activation,
                vec![
                    activation("2024-03-01 10:00:00", 1, 500, 5.0),
                    activation("2024-03-02 10:00:00", 2, 500, 1.0),
                ],
            )
            .unwrap();
        assert_eq!(report.duplicates_removed, 1);

        let all = store.read(Kind::Activation, &ReadFilter::all()).unwrap();
        assert_eq!(all.len(), 2);
        let first = all
            .iter()
            .find(|p| p.record.event_time() == ts("2024-03-01 10:00:00"))
            .unwrap();
        assert_eq!(first.record.rev(), Some(5.0));
        assert_eq!(first.year_month.to_string(), "2024-03");
    }

    #[test]
    fn rewrite_removes_stray_part_files_and_ignores_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let ym = YearMonth::new(2024, 3).unwrap();
        store
            .ingest(Kind::Refund, vec![refund("2024-03-01 09:00:00", 7, 500, 1.0)])
            .unwrap();

        let part_dir = store.partition_dir(Kind::Refund, ym);
        fs::copy(part_dir.join(PART_FILE), part_dir.join("part-000001.stx")).unwrap();
        fs::write(part_dir.join(".tmp-part-000000.stx-1"), b"garbage").unwrap();
        assert_eq!(store.partition_files(Kind::Refund, ym).unwrap().len(), 2);

        let report = store
            .ingest(Kind::Refund, vec![refund("2024-03-02 09:00:00", 8, 500, 2.0)])
            .unwrap();
        assert_eq!(report.partitions[0].files_removed, 1);
        assert_eq!(report.partitions[0].rows, 2);
        assert_eq!(store.partition_files(Kind::Refund, ym).unwrap().len(), 1);
    }

    #[test]
    fn read_date_prunes_by_day() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        store
            .ingest(
                Kind::Activation,
                vec![
                    activation("2024-03-01 10:00:00", 1, 500, 1.0),
                    activation("2024-03-02 10:00:00", 2, 500, 1.0),
                    activation("2024-04-02 10:00:00", 3, 500, 1.0),
                ],
            )
            .unwrap();
        let rows = store.read_date(Kind::Activation, d("2024-03-02")).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(store.read_date(Kind::Activation, d("2024-05-01")).unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_reported_with_code() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let ym = YearMonth::new(2024, 1).unwrap();
        let part_dir = store.partition_dir(Kind::Renewal, ym);
        fs::create_dir_all(&part_dir).unwrap();
        fs::write(part_dir.join(PART_FILE), b"not a stx file at all, definitely not").unwrap();
        let err = store.read_partition(Kind::Renewal, ym).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptPartition);
    }

    #[test]
    fn drifted_part_file_blocks_ingest_and_survives() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let ym = YearMonth::new(2024, 3).unwrap();
        let part = store.partition_dir(Kind::Activation, ym).join(PART_FILE);

        let mut set = ColumnSet::new(&[
            ("TRANS_DT", crate::schema::ColumnType::DateTime),
            ("cpc", crate::schema::ColumnType::Int),
        ]);
        for hour in 0..5 {
            set.push_row(|name| match name {
                "TRANS_DT" => crate::record::Value::DateTime(ts(&format!(
                    "2024-03-01 0{hour}:00:00"
                ))),
                _ => crate::record::Value::Int(500),
            });
        }
        let bytes = columnar::encode(&set, 0).unwrap();
        atomic::write_atomic(&part, &bytes).unwrap();

        let err = store
            .ingest(Kind::Activation, vec![activation("2024-03-02 10:00:00", 1, 500, 1.0)])
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingDateColumn { column: "trans_date", .. }));
        assert_eq!(err.code(), ErrorCode::SchemaDrift);
        assert_eq!(fs::read(&part).unwrap(), bytes);
        assert!(store.dates(Kind::Activation).is_err());

        let report = store.validate(Kind::Activation).unwrap();
        assert_eq!(report.total_rows, 5);
        assert!(report.missing_columns.contains("trans_date"));
    }

    #[test]
    fn undated_rows_are_corrupt_not_dropped() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let ym = YearMonth::new(2024, 3).unwrap();
        let part = store.partition_dir(Kind::Refund, ym).join(PART_FILE);

        let records = vec![refund("2024-03-01 09:00:00", 7, 500, 1.0)];
        let mut set = records_to_columns(Kind::Refund, &records).unwrap();
        set.push_row(|_| crate::record::Value::Null);
        atomic::write_atomic(&part, &columnar::encode(&set, 0).unwrap()).unwrap();

        let err = store.read_partition(Kind::Refund, ym).unwrap_err();
        assert!(matches!(err, StoreError::UndatedRows { rows: 2, dated: 1, .. }));
        assert_eq!(err.code(), ErrorCode::CorruptPartition);
        assert!(
            store
                .ingest(Kind::Refund, vec![refund("2024-03-02 09:00:00", 8, 500, 2.0)])
                .is_err()
        );
        assert_eq!(store.validate(Kind::Refund).unwrap().total_rows, 2);
    }

    #[test]
    fn empty_store_has_no_range() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path().join("missing"));
        assert_eq!(store.range(Kind::Cancellation).unwrap(), None);
        assert!(store.partitions(Kind::Cancellation).unwrap().is_empty());
    }
}

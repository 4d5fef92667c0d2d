//! Informational store checks: sizes, ranges, duplicates, schema drift.
//!
//! Nothing here mutates the store or fails a run. Unreadable files are listed
//! in the report instead of aborting the pass.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::Serialize;

use super::{PartitionStore, StoreError, YearMonth, columns_to_records};
use crate::columnar;
use crate::schema::Kind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSummary {
    pub year_month: YearMonth,
    pub files: usize,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableFile {
    pub path: PathBuf,
    pub error: String,
}

/// Validation result for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindValidation {
    pub kind: Kind,
    pub total_rows: usize,
    pub total_bytes: u64,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub partitions: Vec<PartitionSummary>,
    pub duplicate_keys: usize,
    /// Registry columns absent from at least one file.
    pub missing_columns: BTreeSet<String>,
    /// File columns the registry does not define.
    pub extra_columns: BTreeSet<String>,
    pub unreadable: Vec<UnreadableFile>,
}

impl KindValidation {
    #[must_use]
    pub fn has_schema_drift(&self) -> bool {
        !self.missing_columns.is_empty() || !self.extra_columns.is_empty()
    }
}

impl PartitionStore {
    /// Run the validation pass for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] only if partition directories cannot be
    /// listed; per-file problems are recorded in the report.
    pub fn validate(&self, kind: Kind) -> Result<KindValidation, StoreError> {
        let expected: BTreeSet<&str> = kind.fields().iter().map(|f| f.name()).collect();
        let mut report = KindValidation {
            kind,
            total_rows: 0,
            total_bytes: 0,
            date_range: None,
            partitions: Vec::new(),
            duplicate_keys: 0,
            missing_columns: BTreeSet::new(),
            extra_columns: BTreeSet::new(),
            unreadable: Vec::new(),
        };
        let mut seen_keys = HashSet::new();
        let mut min_date: Option<NaiveDate> = None;
        let mut max_date: Option<NaiveDate> = None;

        for year_month in self.partitions(kind)? {
            let files = self.partition_files(kind, year_month)?;
            let mut summary = PartitionSummary {
                year_month,
                files: files.len(),
                bytes: 0,
                rows: 0,
            };
            for path in files {
                summary.bytes += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let decoded = fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| columnar::decode(&bytes).map_err(|e| e.to_string()));
                let set = match decoded {
                    Ok((_, set)) => set,
                    Err(error) => {
                        report.unreadable.push(UnreadableFile { path, error });
                        continue;
                    }
                };

                let names: BTreeSet<&str> = set.names().into_iter().collect();
                for missing in expected.difference(&names) {
                    report.missing_columns.insert((*missing).to_string());
                }
                for extra in names.difference(&expected) {
                    report.extra_columns.insert((*extra).to_string());
                }

                summary.rows += set.row_count();
                for record in columns_to_records(kind, &set) {
                    let date = record.event_date();
                    min_date = Some(min_date.map_or(date, |m| m.min(date)));
                    max_date = Some(max_date.map_or(date, |m| m.max(date)));
                    if !seen_keys.insert(record.natural_key()) {
                        report.duplicate_keys += 1;
                    }
                }
            }
            report.total_rows += summary.rows;
            report.total_bytes += summary.bytes;
            report.partitions.push(summary);
        }
        report.date_range = min_date.zip(max_date);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::write_atomic;
    use crate::columnar::{ColumnSet, encode};
    use crate::record::Value;
    use crate::record::fixtures::activation;
    use crate::schema::ColumnType;
    use tempfile::TempDir;

    #[test]
    fn clean_store_reports_counts_and_no_drift() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        store
            .ingest(
                Kind::Activation,
                vec![
                    activation("2024-01-31 10:00:00", 1, 500, 1.0),
                    activation("2024-02-01 10:00:00", 2, 500, 1.0),
                ],
            )
            .unwrap();
        let report = store.validate(Kind::Activation).unwrap();
        assert_eq!(report.total_rows, 2);
        assert_eq!(report.partitions.len(), 2);
        assert_eq!(report.duplicate_keys, 0);
        assert!(!report.has_schema_drift());
        assert!(report.total_bytes > 0);
        assert_eq!(
            report.date_range.map(|(a, b)| (a.to_string(), b.to_string())),
            Some(("2024-01-31".to_string(), "2024-02-01".to_string()))
        );
    }

    #[test]
    fn drift_and_corruption_are_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let ym = YearMonth::new(2024, 5).unwrap();
        let part_dir = store.partition_dir(Kind::Cancellation, ym);

        let mut set = ColumnSet::new(&[
            ("cancel_date", ColumnType::DateTime),
            ("cpc", ColumnType::Int),
            ("legacy_flag", ColumnType::Text),
        ]);
        set.push_row(|name| match name {
            "cancel_date" => Value::DateTime(
                chrono::NaiveDateTime::parse_from_str("2024-05-02 00:00:00", "%Y-%m-%d %H:%M:%S")
                    .unwrap(),
            ),
            "cpc" => Value::Int(1),
            _ => Value::Text("x".into()),
        });
        write_atomic(&part_dir.join("part-000000.stx"), &encode(&set, 0).unwrap()).unwrap();
        fs::write(part_dir.join("part-000001.stx"), b"broken").unwrap();

        let report = store.validate(Kind::Cancellation).unwrap();
        assert!(report.has_schema_drift());
        assert!(report.missing_columns.contains("sbn_id"));
        assert!(report.extra_columns.contains("legacy_flag"));
        assert_eq!(report.unreadable.len(), 1);
        assert_eq!(report.total_rows, 1);
    }
}

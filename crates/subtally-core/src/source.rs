//! Raw source file discovery and loading.
//!
//! A [`SourceArchive`] is a directory of delimited exports named
//! `<prefix>*.csv`, one prefix per transaction kind. The same type serves the
//! historical archive and the daily drop directory. Files are decoded as
//! UTF-8 with a Latin-1 fallback, normalized row by row, and reported with
//! per-file counts. A file that cannot be read is skipped and recorded as a
//! failure; the remaining files of the kind are still loaded.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SourcesConfig;
use crate::error::ErrorCode;
use crate::normalize::{ColumnLayout, normalize_row};
use crate::record::TransactionRecord;
use crate::schema::Kind;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no raw files matching {pattern} in {dir}")]
    Missing { dir: PathBuf, pattern: String },

    #[error("{count} candidate files for {kind} in {dir}, refusing to guess")]
    Ambiguous {
        kind: Kind,
        dir: PathBuf,
        count: usize,
    },

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {path} as CSV: {source}")]
    Csv { path: PathBuf, source: csv::Error },
}

impl SourceError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Missing { .. } | Self::Ambiguous { .. } => ErrorCode::SourceMissing,
            Self::Read { .. } | Self::Csv { .. } => ErrorCode::SourceUnreadable,
        }
    }
}

/// Text encoding a file was decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

/// Decode raw bytes as UTF-8, falling back to ISO-8859-1. A UTF-8 BOM is
/// stripped. Latin-1 maps every byte, so decoding never fails.
#[must_use]
pub fn decode_text(bytes: Vec<u8>) -> (String, TextEncoding) {
    let bytes = match bytes.strip_prefix(b"\xEF\xBB\xBF") {
        Some(rest) => rest.to_vec(),
        None => bytes,
    };
    match String::from_utf8(bytes) {
        Ok(text) => (text, TextEncoding::Utf8),
        Err(err) => {
            let text = err.into_bytes().into_iter().map(char::from).collect();
            (text, TextEncoding::Latin1)
        }
    }
}

/// Per-file load statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub encoding: TextEncoding,
    pub rows_read: usize,
    pub rows_dropped: usize,
    pub positional: bool,
}

/// Records and statistics from a batch of files of one kind.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub records: Vec<TransactionRecord>,
    pub files: Vec<FileReport>,
    pub failures: Vec<(PathBuf, SourceError)>,
}

impl LoadedRecords {
    #[must_use]
    pub fn rows_dropped(&self) -> usize {
        self.files.iter().map(|f| f.rows_dropped).sum()
    }

    /// Keep only records whose event date satisfies `keep`.
    pub fn retain_dates(&mut self, mut keep: impl FnMut(NaiveDate) -> bool) {
        self.records.retain(|r| keep(r.event_date()));
    }
}

/// Read and normalize one raw file.
///
/// # Errors
///
/// Returns [`SourceError::Read`] if the file cannot be opened and
/// [`SourceError::Csv`] if the header row cannot be parsed.
pub fn read_file(
    kind: Kind,
    path: &Path,
) -> Result<(Vec<TransactionRecord>, FileReport), SourceError> {
    let bytes = fs::read(path).map_err(|source| SourceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let (text, encoding) = decode_text(bytes);
    if encoding == TextEncoding::Latin1 {
        debug!(path = %path.display(), "decoded with latin-1 fallback");
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = reader.records();

    let layout = match rows.next() {
        Some(Ok(header)) => {
            let cells: Vec<&str> = header.iter().collect();
            ColumnLayout::from_header(kind, &cells)
        }
        Some(Err(source)) => {
            return Err(SourceError::Csv {
                path: path.to_path_buf(),
                source,
            });
        }
        None => ColumnLayout::positional(kind),
    };

    let mut records = Vec::new();
    let mut rows_read = 0usize;
    let mut rows_dropped = 0usize;
    for row in rows {
        rows_read += 1;
        let Ok(row) = row else {
            rows_dropped += 1;
            continue;
        };
        let cells: Vec<&str> = row.iter().collect();
        match normalize_row(kind, &layout, &cells) {
            Some(record) => records.push(record),
            None => rows_dropped += 1,
        }
    }

    let report = FileReport {
        path: path.to_path_buf(),
        encoding,
        rows_read,
        rows_dropped,
        positional: layout.is_positional(),
    };
    info!(
        kind = %kind,
        file = %path.display(),
        rows = rows_read,
        dropped = rows_dropped,
        "read raw file"
    );
    Ok((records, report))
}

/// A directory of raw per-kind exports.
#[derive(Debug, Clone)]
pub struct SourceArchive {
    dir: PathBuf,
    prefixes: SourcesConfig,
}

impl SourceArchive {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, prefixes: SourcesConfig) -> Self {
        Self {
            dir: dir.into(),
            prefixes,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Same prefixes, another directory.
    #[must_use]
    pub fn with_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..self
        }
    }

    fn matching(&self, kind: Kind, infix: Option<&str>) -> Vec<PathBuf> {
        let prefix = self.prefixes.prefix_for(kind);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| {
                        let Some(rest) = name.strip_prefix(prefix) else {
                            return false;
                        };
                        let Some(middle) = rest.strip_suffix(".csv") else {
                            return false;
                        };
                        infix.is_none_or(|needle| middle.contains(needle))
                    })
            })
            .collect();
        files.sort();
        files
    }

    /// Every `<prefix>*.csv` file for `kind`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Missing`] when no file matches.
    pub fn files_for(&self, kind: Kind) -> Result<Vec<PathBuf>, SourceError> {
        let files = self.matching(kind, None);
        if files.is_empty() {
            return Err(self.missing(kind, None));
        }
        Ok(files)
    }

    /// Daily file(s) for `kind` on `date`: `<prefix>*day*.csv`, else
    /// `<prefix>*YYYYMMDD*.csv`, else a single `<prefix>*.csv`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Missing`] when nothing matches and
    /// [`SourceError::Ambiguous`] when only the bare prefix matches and more
    /// than one file does.
    pub fn daily_files(&self, kind: Kind, date: NaiveDate) -> Result<Vec<PathBuf>, SourceError> {
        let by_day = self.matching(kind, Some("day"));
        if !by_day.is_empty() {
            return Ok(by_day);
        }
        let stamp = date.format("%Y%m%d").to_string();
        let by_date = self.matching(kind, Some(&stamp));
        if !by_date.is_empty() {
            return Ok(by_date);
        }
        let any = self.matching(kind, None);
        match any.len() {
            0 => Err(self.missing(kind, Some(&stamp))),
            1 => Ok(any),
            count => Err(SourceError::Ambiguous {
                kind,
                dir: self.dir.clone(),
                count,
            }),
        }
    }

    fn missing(&self, kind: Kind, infix: Option<&str>) -> SourceError {
        let prefix = self.prefixes.prefix_for(kind);
        let pattern = match infix {
            Some(infix) => format!("{prefix}*{infix}*.csv"),
            None => format!("{prefix}*.csv"),
        };
        SourceError::Missing {
            dir: self.dir.clone(),
            pattern,
        }
    }

    /// Load every archive file for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Missing`] when the kind has no files. Per-file
    /// failures are collected in [`LoadedRecords::failures`] instead.
    pub fn load_kind(&self, kind: Kind) -> Result<LoadedRecords, SourceError> {
        let files = self.files_for(kind)?;
        Ok(load_files(kind, &files))
    }
}

/// Load `files` as `kind`, skipping (and recording) unreadable ones.
#[must_use]
pub fn load_files(kind: Kind, files: &[PathBuf]) -> LoadedRecords {
    let mut loaded = LoadedRecords::default();
    for path in files {
        match read_file(kind, path) {
            Ok((records, report)) => {
                loaded.records.extend(records);
                loaded.files.push(report);
            }
            Err(err) => {
                warn!(kind = %kind, file = %path.display(), error = %err, "skipping unreadable file");
                loaded.failures.push((path.clone(), err));
            }
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn archive(dir: &TempDir) -> SourceArchive {
        SourceArchive::new(dir.path(), SourcesConfig::default())
    }

    fn touch(dir: &TempDir, name: &str, body: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn latin1_fallback_maps_every_byte() {
        let (text, enc) = decode_text(b"Espa\xF1a".to_vec());
        assert_eq!(enc, TextEncoding::Latin1);
        assert_eq!(text, "España");

        let (text, enc) = decode_text("\u{feff}España".as_bytes().to_vec());
        assert_eq!(enc, TextEncoding::Utf8);
        assert_eq!(text, "España");
    }

    #[test]
    fn read_file_counts_dropped_rows() {
        let dir = TempDir::new().unwrap();
        let path = touch(
            &dir,
            "cnr_atlas_1.csv",
            b"cancel_date,sbn_id,tmuserid,cpc,mode\n\
              2024-01-01 10:00:00,1,tm1,500,USER\n\
              ,2,tm2,500,USER\n\
              2024-01-02,3,tm3,NULL,SYSTEM\n",
        );
        let (records, report) = read_file(Kind::Cancellation, &path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.rows_dropped, 1);
        assert_eq!(records[1].cpc(), None);
    }

    #[test]
    fn files_for_filters_by_prefix_and_extension() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "act_atlas_2024.csv", b"");
        touch(&dir, "act_atlas_2023.csv", b"");
        touch(&dir, "act_atlas_2023.txt", b"");
        touch(&dir, "reno_atlas_2023.csv", b"");

        let files = archive(&dir).files_for(Kind::Activation).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["act_atlas_2023.csv", "act_atlas_2024.csv"]);

        let err = archive(&dir).files_for(Kind::Refund).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SourceMissing);
    }

    #[test]
    fn daily_discovery_prefers_day_then_date_then_single() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();

        let dir = TempDir::new().unwrap();
        touch(&dir, "act_atlas_20240305.csv", b"");
        touch(&dir, "act_atlas_day.csv", b"");
        let files = archive(&dir).daily_files(Kind::Activation, date).unwrap();
        assert!(files[0].ends_with("act_atlas_day.csv"));

        let dir = TempDir::new().unwrap();
        touch(&dir, "act_atlas_20240304.csv", b"");
        touch(&dir, "act_atlas_20240305.csv", b"");
        let files = archive(&dir).daily_files(Kind::Activation, date).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("act_atlas_20240305.csv"));

        let dir = TempDir::new().unwrap();
        touch(&dir, "act_atlas_latest.csv", b"");
        assert_eq!(archive(&dir).daily_files(Kind::Activation, date).unwrap().len(), 1);
        touch(&dir, "act_atlas_other.csv", b"");
        assert!(matches!(
            archive(&dir).daily_files(Kind::Activation, date),
            Err(SourceError::Ambiguous { count: 2, .. })
        ));
    }

    #[test]
    fn unreadable_file_does_not_stop_the_kind() {
        let dir = TempDir::new().unwrap();
        let good = touch(
            &dir,
            "rfnd_atlas_a.csv",
            b"tmuserid,cpc,refnd_date,rfnd_amount,rfnd_cnt,sbnid,instant_rfnd\n\
              tm1,500,2024-01-01,9.99,1,7,N\n",
        );
        let missing = dir.path().join("rfnd_atlas_gone.csv");
        let loaded = load_files(Kind::Refund, &[missing, good]);
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.failures.len(), 1);
        assert_eq!(loaded.failures[0].1.code(), ErrorCode::SourceUnreadable);
    }
}

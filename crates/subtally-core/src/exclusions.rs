//! Subjects whose transactions are kept in the store but left out of counters.
//!
//! The list file is optional. It is a CSV with an `msisdn` column and an
//! optional `tmuserid` column, or a legacy headerless file with one MSISDN
//! per line.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{info, warn};

use crate::record::TransactionRecord;
use crate::source::decode_text;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedSubjects {
    msisdns: HashSet<String>,
    tmuserids: HashSet<String>,
}

impl ExcludedSubjects {
    #[must_use]
    pub fn new(
        msisdns: impl IntoIterator<Item = String>,
        tmuserids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            msisdns: msisdns.into_iter().filter(|s| !s.is_empty()).collect(),
            tmuserids: tmuserids.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Load the list at `path`. A missing file means nobody is excluded; an
    /// unreadable file is logged and also treated as empty so a bad list never
    /// blocks a counter build.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read excluded users, excluding nobody");
                return Self::default();
            }
        };
        let (text, _) = decode_text(bytes);
        match Self::parse(&text) {
            Ok(list) => {
                info!(
                    path = %path.display(),
                    msisdns = list.msisdns.len(),
                    tmuserids = list.tmuserids.len(),
                    "loaded excluded users"
                );
                list
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot parse excluded users, excluding nobody");
                Self::default()
            }
        }
    }

    fn parse(text: &str) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let mut rows = reader.records();
        let Some(first) = rows.next().transpose()? else {
            return Ok(Self::default());
        };

        let position = |name: &str| first.iter().position(|h| h.eq_ignore_ascii_case(name));
        let (msisdn_at, tmuserid_at, legacy_first) = match position("msisdn") {
            Some(at) => (at, position("tmuserid"), None),
            None => (0, None, first.get(0).map(str::to_string)),
        };

        let mut msisdns: Vec<String> = legacy_first.into_iter().collect();
        let mut tmuserids = Vec::new();
        for row in rows {
            let row = row?;
            if let Some(m) = row.get(msisdn_at) {
                msisdns.push(m.to_string());
            }
            if let Some(t) = tmuserid_at.and_then(|at| row.get(at)) {
                tmuserids.push(t.to_string());
            }
        }
        Ok(Self::new(msisdns, tmuserids))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.msisdns.is_empty() && self.tmuserids.is_empty()
    }

    /// Whether `record` belongs to an excluded subject. Records with no
    /// subject identifiers are never excluded.
    #[must_use]
    pub fn excludes(&self, record: &TransactionRecord) -> bool {
        record.msisdn().is_some_and(|m| self.msisdns.contains(m))
            || record.tmuserid().is_some_and(|t| self.tmuserids.contains(t))
    }
}

//! Backfill of missing store dates from the raw archive.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::gap::{self, GapReport, GapSkip};
use crate::source::{SourceArchive, SourceError};
use crate::store::{IngestReport, PartitionStore};
use crate::schema::Kind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    /// The store has no data for the kind; run a full archive ingest first.
    SkippedEmptyStore,
    /// The archive has no readable rows for the kind.
    SkippedEmptyArchive,
    NoGaps,
    /// Gaps were found but nothing was written.
    DryRun,
    Repaired,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillOutcome {
    pub kind: Kind,
    pub status: BackfillStatus,
    pub gaps: Option<GapReport>,
    pub rows_ingested: usize,
    pub ingest: Option<IngestReport>,
    pub unreadable_files: usize,
}

impl BackfillOutcome {
    fn skipped(kind: Kind, status: BackfillStatus, unreadable_files: usize) -> Self {
        Self {
            kind,
            status,
            gaps: None,
            rows_ingested: 0,
            ingest: None,
            unreadable_files,
        }
    }
}

/// Detect gaps for `kind` and, unless `dry_run`, re-ingest the archive rows
/// that fall on missing dates. Re-running is safe: ingestion deduplicates by
/// natural key.
///
/// # Errors
///
/// Returns an error if the store cannot be read or a partition rewrite fails.
pub fn backfill_kind(
    store: &PartitionStore,
    archive: &SourceArchive,
    kind: Kind,
    dry_run: bool,
) -> Result<BackfillOutcome> {
    let store_dates = store
        .dates(kind)
        .with_context(|| format!("failed to scan store dates for {kind}"))?;
    if store_dates.is_empty() {
        warn!(kind = %kind, "no data in store, run a full archive ingest first");
        return Ok(BackfillOutcome::skipped(kind, BackfillStatus::SkippedEmptyStore, 0));
    }

    let mut loaded = match archive.load_kind(kind) {
        Ok(loaded) => loaded,
        Err(err @ SourceError::Missing { .. }) => {
            warn!(kind = %kind, error = %err, "no archive files");
            return Ok(BackfillOutcome::skipped(kind, BackfillStatus::SkippedEmptyArchive, 0));
        }
        Err(err) => return Err(err).with_context(|| format!("failed to load archive for {kind}")),
    };
    let unreadable_files = loaded.failures.len();
    let archive_dates: BTreeSet<NaiveDate> =
        loaded.records.iter().map(|r| r.event_date()).collect();

    let report = match gap::detect(kind, &store_dates, &archive_dates) {
        Ok(report) => report,
        Err(GapSkip::EmptyStore) => {
            return Ok(BackfillOutcome::skipped(
                kind,
                BackfillStatus::SkippedEmptyStore,
                unreadable_files,
            ));
        }
        Err(GapSkip::EmptyArchive) => {
            warn!(kind = %kind, "archive has no readable rows");
            return Ok(BackfillOutcome::skipped(
                kind,
                BackfillStatus::SkippedEmptyArchive,
                unreadable_files,
            ));
        }
    };

    if report.missing.is_empty() {
        info!(kind = %kind, dates = report.store_dates, "no gaps detected");
        return Ok(BackfillOutcome {
            kind,
            status: BackfillStatus::NoGaps,
            gaps: Some(report),
            rows_ingested: 0,
            ingest: None,
            unreadable_files,
        });
    }

    for range in &report.ranges {
        info!(kind = %kind, range = %range, days = range.days(), "missing dates");
    }

    if dry_run {
        return Ok(BackfillOutcome {
            kind,
            status: BackfillStatus::DryRun,
            gaps: Some(report),
            rows_ingested: 0,
            ingest: None,
            unreadable_files,
        });
    }

    let missing: BTreeSet<NaiveDate> = report.missing.iter().copied().collect();
    loaded.retain_dates(|d| missing.contains(&d));
    let rows = loaded.records.len();
    if rows == 0 {
        warn!(kind = %kind, "archive has no rows for any missing date");
    }
    let ingest = store
        .ingest(kind, loaded.records)
        .with_context(|| format!("failed to ingest backfill rows for {kind}"))?;
    info!(kind = %kind, rows, recovered = report.recoverable.len(), "backfill complete");

    Ok(BackfillOutcome {
        kind,
        status: BackfillStatus::Repaired,
        gaps: Some(report),
        rows_ingested: rows,
        ingest: Some(ingest),
        unreadable_files,
    })
}

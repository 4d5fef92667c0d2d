//! Run drivers: one unit of work per kind or per date.
//!
//! A failing unit is logged, recorded as a [`UnitFailure`] and the run moves
//! on. Callers decide the exit status from [`RunReport::is_success`] once
//! every unit has run.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::backfill::{self, BackfillOutcome};
use crate::config::{ProjectConfig, ResolvedPaths, load_project_config};
use crate::counters::{self, CounterPaths, DailyCounterRow};
use crate::error::ErrorCode;
use crate::exclusions::ExcludedSubjects;
use crate::mapping::CodeMapping;
use crate::schema::Kind;
use crate::service::{self, DenylistPolicy};
use crate::source::{self, SourceArchive, SourceError};
use crate::store::{IngestReport, KindValidation, PartitionStore};

/// Component handles built from a resolved configuration.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub paths: ResolvedPaths,
    pub store: PartitionStore,
    pub archive: SourceArchive,
    pub daily: SourceArchive,
    pub counters: CounterPaths,
    pub denylist: DenylistPolicy,
    pub unknown_name: String,
    pub upgrade_channel: String,
}

impl Workspace {
    #[must_use]
    pub fn from_config(root: &Path, config: &ProjectConfig) -> Self {
        let paths = config.resolve_paths(root);
        Self {
            store: PartitionStore::new(&paths.store),
            archive: SourceArchive::new(&paths.archive, config.sources.clone()),
            daily: SourceArchive::new(&paths.daily, config.sources.clone()),
            counters: CounterPaths::in_dir(&paths.counters),
            denylist: DenylistPolicy::new(&config.services.denylist),
            unknown_name: config.services.unknown_name.clone(),
            upgrade_channel: config.counters.upgrade_channel.clone(),
            paths,
        }
    }

    /// Load `<root>/subtally.toml` and build the handles.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but is malformed.
    pub fn open(root: &Path) -> Result<Self> {
        let config = load_project_config(root)?;
        Ok(Self::from_config(root, &config))
    }

    /// Replace the archive directory, keeping the configured prefixes.
    #[must_use]
    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive = self.archive.with_dir(dir);
        self
    }
}

/// One unit that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub code: ErrorCode,
    pub error: String,
}

impl UnitFailure {
    fn record(unit: impl fmt::Display, err: &anyhow::Error) -> Self {
        let code = ErrorCode::classify(err);
        error!(unit = %unit, code = %code, error = %format!("{err:#}"), "unit failed");
        Self {
            unit: unit.to_string(),
            code,
            error: format!("{err:#}"),
        }
    }
}

/// Outcomes of every unit that ran plus the ones that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport<T> {
    pub outcomes: Vec<T>,
    pub failures: Vec<UnitFailure>,
}

impl<T> Default for RunReport<T> {
    fn default() -> Self {
        Self {
            outcomes: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> RunReport<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn settle(&mut self, unit: impl fmt::Display, result: Result<T>) {
        match result {
            Ok(outcome) => self.outcomes.push(outcome),
            Err(err) => self.failures.push(UnitFailure::record(unit, &err)),
        }
    }
}

/// Raw files to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    /// The daily drop directory's file(s) for one date.
    Daily(NaiveDate),
    /// Every file of the historical archive.
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Ingested,
    NoSourceFiles,
}

/// Result of ingesting one kind.
#[derive(Debug, Clone, Serialize)]
pub struct KindIngest {
    pub kind: Kind,
    pub status: IngestStatus,
    pub files: usize,
    pub rows_read: usize,
    pub rows_dropped: usize,
    pub unreadable_files: Vec<PathBuf>,
    pub report: Option<IngestReport>,
}

impl KindIngest {
    fn no_source(kind: Kind) -> Self {
        Self {
            kind,
            status: IngestStatus::NoSourceFiles,
            files: 0,
            rows_read: 0,
            rows_dropped: 0,
            unreadable_files: Vec::new(),
            report: None,
        }
    }
}

/// Normalize raw files into the store, one kind at a time.
#[must_use]
pub fn run_ingest(ws: &Workspace, kinds: &[Kind], from: IngestSource) -> RunReport<KindIngest> {
    let mut report = RunReport::default();
    for &kind in kinds {
        let result = ingest_kind(ws, kind, from);
        report.settle(kind, result);
    }
    report
}

fn ingest_kind(ws: &Workspace, kind: Kind, from: IngestSource) -> Result<KindIngest> {
    let files = match from {
        IngestSource::Daily(date) => ws.daily.daily_files(kind, date),
        IngestSource::Archive => ws.archive.files_for(kind),
    };
    let files = match files {
        Ok(files) => files,
        Err(err @ (SourceError::Missing { .. } | SourceError::Ambiguous { .. })) => {
            warn!(kind = %kind, error = %err, "skipping kind");
            return Ok(KindIngest::no_source(kind));
        }
        Err(err) => return Err(err).with_context(|| format!("failed to list raw files for {kind}")),
    };

    let loaded = source::load_files(kind, &files);
    let unreadable_files: Vec<PathBuf> = loaded.failures.iter().map(|(p, _)| p.clone()).collect();
    for (path, err) in &loaded.failures {
        warn!(kind = %kind, file = %path.display(), error = %err, "skipped unreadable file");
    }
    let rows_read = loaded.files.iter().map(|f| f.rows_read).sum();
    let rows_dropped = loaded.rows_dropped();
    let file_count = loaded.files.len();

    let ingest = ws
        .store
        .ingest(kind, loaded.records)
        .with_context(|| format!("failed to ingest {kind}"))?;
    Ok(KindIngest {
        kind,
        status: IngestStatus::Ingested,
        files: file_count,
        rows_read,
        rows_dropped,
        unreadable_files,
        report: Some(ingest),
    })
}

/// Gap detection and backfill, one kind at a time.
#[must_use]
pub fn run_backfill(ws: &Workspace, kinds: &[Kind], dry_run: bool) -> RunReport<BackfillOutcome> {
    let mut report = RunReport::default();
    for &kind in kinds {
        let result = backfill::backfill_kind(&ws.store, &ws.archive, kind, dry_run);
        report.settle(kind, result);
    }
    report
}

/// Informational validation of every kind.
#[must_use]
pub fn run_validate(ws: &Workspace, kinds: &[Kind]) -> RunReport<KindValidation> {
    let mut report = RunReport::default();
    for &kind in kinds {
        let result = ws
            .store
            .validate(kind)
            .with_context(|| format!("failed to validate {kind}"));
        if let Ok(validation) = &result
            && validation.has_schema_drift()
        {
            warn!(
                kind = %kind,
                code = %ErrorCode::SchemaDrift,
                missing = ?validation.missing_columns,
                extra = ?validation.extra_columns,
                "schema drift"
            );
        }
        report.settle(kind, result);
    }
    report
}

/// Which dates a counters run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSelection {
    Single(NaiveDate),
    Range(NaiveDate, NaiveDate),
    /// Store dates missing from the per-code table (every store date when
    /// forced).
    Backfill,
}

impl DateSelection {
    /// The default selection: yesterday in local time.
    #[must_use]
    pub fn yesterday() -> Self {
        Self::Single(yesterday())
    }
}

/// Yesterday in local time, the default day for daily runs.
#[must_use]
pub fn yesterday() -> NaiveDate {
    let today = Local::now().date_naive();
    today.pred_opt().unwrap_or(today)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Built,
    /// No store rows for the date; the date was cleared from the table.
    Empty,
    /// Already in the table and not forced.
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayOutcome {
    pub date: NaiveDate,
    pub status: DayStatus,
    pub codes: usize,
    pub excluded: usize,
}

/// Result of [`run_counters`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountersRun {
    pub days: RunReport<DayOutcome>,
    pub table_rows: usize,
    pub services: usize,
    pub unmapped: Vec<i64>,
}

impl CountersRun {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.days.is_success()
    }
}

/// Wall-clock stamp for merged rows, truncated to whole seconds.
#[must_use]
pub fn stamp_now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Every date present in any kind of the store.
///
/// A kind whose partitions cannot be scanned is recorded as a
/// `<kind>-dates` failure; the dates of the other kinds are still returned.
#[must_use]
pub fn store_dates(store: &PartitionStore) -> (BTreeSet<NaiveDate>, Vec<UnitFailure>) {
    let mut dates = BTreeSet::new();
    let mut failures = Vec::new();
    for kind in Kind::ALL {
        match store
            .dates(kind)
            .with_context(|| format!("failed to scan dates for {kind}"))
        {
            Ok(found) => dates.extend(found),
            Err(err) => failures.push(UnitFailure::record(format!("{kind}-dates"), &err)),
        }
    }
    (dates, failures)
}

/// Build, merge and publish counters for the selected dates.
///
/// The per-code table is rewritten after every built date, so progress
/// survives a later failure. The per-service table is recomputed from the
/// full per-code table once at the end.
///
/// # Errors
///
/// Returns an error only for run-level problems: the code mapping or the
/// existing per-code table cannot be loaded. Per-date failures, and kinds
/// whose dates cannot be scanned in backfill mode, are recorded in the
/// report.
pub fn run_counters(
    ws: &Workspace,
    selection: DateSelection,
    force: bool,
    now: NaiveDateTime,
) -> Result<CountersRun> {
    let mapping = CodeMapping::load(&ws.paths.mapping, &ws.unknown_name)
        .context("failed to load the code mapping")?;
    let exclusions = ExcludedSubjects::load(&ws.paths.excluded_users);
    let mut table = counters::load_code_table(&ws.counters.code_table)
        .context("failed to load the per-code counter table")?;
    let processed: BTreeSet<NaiveDate> = table.iter().map(|r| r.date).collect();

    let mut days = RunReport::default();
    let dates: Vec<NaiveDate> = match selection {
        DateSelection::Single(date) => vec![date],
        DateSelection::Range(start, end) => start.iter_days().take_while(|d| *d <= end).collect(),
        DateSelection::Backfill => {
            let (all, scan_failures) = store_dates(&ws.store);
            days.failures.extend(scan_failures);
            if force {
                all.into_iter().collect()
            } else {
                all.difference(&processed).copied().collect()
            }
        }
    };
    info!(dates = dates.len(), force, "building counters");

    for date in dates {
        if !force && processed.contains(&date) {
            info!(date = %date, "already processed, use --force to recompute");
            days.outcomes.push(DayOutcome {
                date,
                status: DayStatus::AlreadyProcessed,
                codes: 0,
                excluded: 0,
            });
            continue;
        }
        let result = build_and_publish(ws, &mut table, date, &exclusions, now);
        days.settle(date, result);
    }

    let aggregation = service::aggregate(&table, &mapping, &ws.denylist, &ws.unknown_name);
    if let Err(err) = service::write_service_table(&ws.counters.service_table, &aggregation.rows) {
        let err = anyhow::Error::from(err).context("failed to publish the per-service table");
        days.failures.push(UnitFailure::record("service-table", &err));
    }

    Ok(CountersRun {
        days,
        table_rows: table.len(),
        services: aggregation
            .rows
            .iter()
            .map(|r| r.service_name.as_str())
            .collect::<BTreeSet<_>>()
            .len(),
        unmapped: aggregation.unmapped,
    })
}

fn build_and_publish(
    ws: &Workspace,
    table: &mut Vec<DailyCounterRow>,
    date: NaiveDate,
    exclusions: &ExcludedSubjects,
    now: NaiveDateTime,
) -> Result<DayOutcome> {
    let tally = counters::build_day(&ws.store, date, exclusions, &ws.upgrade_channel)
        .with_context(|| format!("failed to build counters for {date}"))?;
    if tally.is_empty() {
        warn!(date = %date, "no transactions for date");
    }
    let codes = tally.rows.len();
    let merged = counters::merge(table.clone(), tally.rows, date, now);
    counters::write_code_table(&ws.counters.code_table, &merged)
        .with_context(|| format!("failed to publish counters for {date}"))?;
    *table = merged;
    Ok(DayOutcome {
        date,
        status: if codes == 0 {
            DayStatus::Empty
        } else {
            DayStatus::Built
        },
        codes,
        excluded: tally.excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::activation;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::from_config(dir.path(), &ProjectConfig::default());
        fs::write(
            &ws.paths.mapping,
            "Service Name,TME Category,Free_CPC,Free_Period,Upgrade_CPC,CHG_Period,CHG_Price,CPCs\n\
             Music Plus,MUSIC,,0,501,Monthly,4.99,{500}\n",
        )
        .unwrap();
        (dir, ws)
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn missing_sources_skip_kinds_without_failing() {
        let (_dir, ws) = workspace();
        let report = run_ingest(&ws, &Kind::ALL, IngestSource::Archive);
        assert!(report.is_success());
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.status == IngestStatus::NoSourceFiles)
        );
    }

    #[test]
    fn counters_skip_processed_dates_unless_forced() {
        let (_dir, ws) = workspace();
        ws.store
            .ingest(
                Kind::Activation,
                vec![activation("2024-01-02 10:00:00", 1, 500, 4.99)],
            )
            .unwrap();
        let now = stamp_now();

        let first = run_counters(&ws, DateSelection::Backfill, false, now).unwrap();
        assert!(first.is_success());
        assert_eq!(first.days.outcomes[0].status, DayStatus::Built);
        assert_eq!(first.services, 1);

        let again = run_counters(&ws, DateSelection::Single(d("2024-01-02")), false, now).unwrap();
        assert_eq!(again.days.outcomes[0].status, DayStatus::AlreadyProcessed);

        let backfill = run_counters(&ws, DateSelection::Backfill, false, now).unwrap();
        assert!(backfill.days.outcomes.is_empty());

        let forced = run_counters(&ws, DateSelection::Single(d("2024-01-02")), true, now).unwrap();
        assert_eq!(forced.days.outcomes[0].status, DayStatus::Built);
        assert_eq!(forced.table_rows, 1);
    }

    #[test]
    fn empty_date_is_reported_not_failed() {
        let (_dir, ws) = workspace();
        let run = run_counters(
            &ws,
            DateSelection::Range(d("2024-01-01"), d("2024-01-03")),
            false,
            stamp_now(),
        )
        .unwrap();
        assert!(run.is_success());
        assert_eq!(run.days.outcomes.len(), 3);
        assert!(run.days.outcomes.iter().all(|o| o.status == DayStatus::Empty));
        assert!(ws.counters.service_table.exists());
    }

    #[test]
    fn missing_mapping_is_a_run_error() {
        let (_dir, ws) = workspace();
        fs::remove_file(&ws.paths.mapping).unwrap();
        let err = run_counters(&ws, DateSelection::Backfill, false, stamp_now()).unwrap_err();
        assert_eq!(ErrorCode::classify(&err), ErrorCode::MappingUnreadable);
    }

    #[test]
    fn corrupt_partition_fails_one_kind_only() {
        let (_dir, ws) = workspace();
        let part = ws
            .store
            .partition_dir(Kind::Renewal, crate::store::YearMonth::new(2024, 1).unwrap());
        fs::create_dir_all(&part).unwrap();
        fs::write(part.join("part-000000.stx"), b"junk").unwrap();

        let report = run_validate(&ws, &[Kind::Activation, Kind::Renewal]);
        assert!(report.is_success());
        assert_eq!(report.outcomes[1].unreadable.len(), 1);

        let backfill = run_backfill(&ws, &[Kind::Renewal, Kind::Activation], true);
        assert_eq!(backfill.failures.len(), 1);
        assert_eq!(backfill.failures[0].unit, "reno");
        assert_eq!(backfill.failures[0].code, ErrorCode::CorruptPartition);
        assert_eq!(backfill.outcomes.len(), 1);

        let json = serde_json::to_value(&backfill).unwrap();
        assert_eq!(json["failures"][0]["unit"], "reno");
        assert_eq!(json["failures"][0]["code"], "E3002");
        assert_eq!(json["outcomes"][0]["kind"], "activation");
        assert_eq!(json["outcomes"][0]["status"], "skipped_empty_store");
    }

    #[test]
    fn unreadable_kind_does_not_stop_counter_backfill() {
        let (_dir, ws) = workspace();
        ws.store
            .ingest(
                Kind::Activation,
                vec![activation("2024-01-02 10:00:00", 1, 500, 4.99)],
            )
            .unwrap();
        let part = ws
            .store
            .partition_dir(Kind::Cancellation, crate::store::YearMonth::new(2023, 6).unwrap());
        fs::create_dir_all(&part).unwrap();
        fs::write(part.join("part-000000.stx"), b"junk").unwrap();

        let run = run_counters(&ws, DateSelection::Backfill, false, stamp_now()).unwrap();
        assert!(!run.is_success());
        assert_eq!(run.days.failures.len(), 1);
        assert_eq!(run.days.failures[0].unit, "cnr-dates");
        assert_eq!(run.days.failures[0].code, ErrorCode::CorruptPartition);

        assert_eq!(run.days.outcomes.len(), 1);
        assert_eq!(run.days.outcomes[0].date, d("2024-01-02"));
        assert_eq!(run.days.outcomes[0].status, DayStatus::Built);
        assert_eq!(run.table_rows, 1);
        assert!(ws.counters.service_table.exists());
    }
}

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use subtally_core::backfill::{BackfillOutcome, BackfillStatus};
use subtally_core::pipeline::{self, RunReport, Workspace};
use subtally_core::schema::Kind;

use crate::cmd::selected_kinds;
use crate::output::{OutputMode, Summary, pretty_kv, pretty_section, render_mode, write_failures};

/// Arguments for `subtally backfill`.
#[derive(Args, Debug)]
pub struct BackfillArgs {
    /// Report gaps without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Archive directory to recover from, overriding `[paths] archive`.
    #[arg(long, value_name = "DIR")]
    pub source: Option<PathBuf>,

    /// Restrict to one transaction kind (repeatable).
    #[arg(long = "kind", value_name = "KIND")]
    pub kinds: Vec<Kind>,
}

#[derive(Debug, Serialize)]
struct BackfillOutput {
    dry_run: bool,
    #[serde(flatten)]
    report: RunReport<BackfillOutcome>,
    summary: Summary,
}

const fn is_skip(status: BackfillStatus) -> bool {
    matches!(
        status,
        BackfillStatus::SkippedEmptyStore | BackfillStatus::SkippedEmptyArchive
    )
}

/// Detect store gaps per kind and re-ingest the archive rows that fill them.
///
/// # Errors
///
/// Returns an error after rendering the report if any kind failed.
pub fn run_backfill(args: &BackfillArgs, output: OutputMode, ws: Workspace) -> Result<()> {
    let ws = match &args.source {
        Some(dir) => ws.with_archive_dir(dir),
        None => ws,
    };
    let report = pipeline::run_backfill(&ws, &selected_kinds(&args.kinds), args.dry_run);
    let skipped = report.outcomes.iter().filter(|o| is_skip(o.status)).count();
    let payload = BackfillOutput {
        dry_run: args.dry_run,
        summary: Summary {
            processed: report.outcomes.len() - skipped,
            skipped,
            failed: report.failures.len(),
        },
        report,
    };

    render_mode(output, &payload, render_backfill_text, render_backfill_pretty)?;
    payload.summary.into_result("backfill")
}

fn status_label(outcome: &BackfillOutcome) -> String {
    match outcome.status {
        BackfillStatus::SkippedEmptyStore => {
            "skipped, store is empty (run `subtally ingest --archive` first)".to_string()
        }
        BackfillStatus::SkippedEmptyArchive => "skipped, archive has no rows".to_string(),
        BackfillStatus::NoGaps => "no gaps".to_string(),
        BackfillStatus::DryRun => "gaps found (dry run, nothing written)".to_string(),
        BackfillStatus::Repaired => format!("repaired, {} row(s) ingested", outcome.rows_ingested),
    }
}

fn render_backfill_text(payload: &BackfillOutput, w: &mut dyn Write) -> io::Result<()> {
    for outcome in &payload.report.outcomes {
        let tag = if is_skip(outcome.status) { "SKIP" } else { "OK  " };
        write!(w, "{tag} {:<4} {}", outcome.kind, status_label(outcome))?;
        if let Some(gaps) = &outcome.gaps {
            write!(
                w,
                " missing={} recoverable={}",
                gaps.missing.len(),
                gaps.recoverable.len()
            )?;
        }
        writeln!(w)?;
    }
    write_failures(w, &payload.report.failures)?;
    payload.summary.write(w, "backfill")
}

fn render_backfill_pretty(payload: &BackfillOutput, w: &mut dyn Write) -> io::Result<()> {
    let heading = if payload.dry_run {
        "Backfill (dry run)"
    } else {
        "Backfill"
    };
    pretty_section(w, heading)?;
    for outcome in &payload.report.outcomes {
        pretty_kv(w, &outcome.kind.to_string(), status_label(outcome))?;
        let Some(gaps) = &outcome.gaps else {
            continue;
        };
        writeln!(
            w,
            "{:<14} store {}..{} ({} date(s)), {} missing, {} recoverable",
            "",
            gaps.store_range.0,
            gaps.store_range.1,
            gaps.store_dates,
            gaps.missing.len(),
            gaps.recoverable.len()
        )?;
        for range in &gaps.ranges {
            writeln!(w, "{:<14} gap {range} ({} day(s))", "", range.days())?;
        }
        if outcome.unreadable_files > 0 {
            writeln!(w, "{:<14} {} unreadable archive file(s)", "", outcome.unreadable_files)?;
        }
    }
    writeln!(w)?;
    write_failures(w, &payload.report.failures)?;
    payload.summary.write(w, "backfill")
}

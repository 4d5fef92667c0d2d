use std::io::{self, Write};

use anyhow::Result;
use chrono::NaiveDate;
use clap::Args;
use serde::Serialize;
use subtally_core::pipeline::{self, IngestSource, IngestStatus, KindIngest, RunReport, Workspace};
use subtally_core::schema::Kind;

use crate::cmd::selected_kinds;
use crate::output::{OutputMode, Summary, pretty_kv, pretty_section, render_mode, write_failures};

/// Arguments for `subtally ingest`.
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Date of the daily drop files to ingest (YYYY-MM-DD). Defaults to yesterday.
    #[arg(long, value_name = "DATE", conflicts_with = "archive")]
    pub date: Option<NaiveDate>,

    /// Ingest every file of the historical archive instead of one day.
    #[arg(long)]
    pub archive: bool,

    /// Restrict to one transaction kind (repeatable): act, reno, dct, cnr, rfnd, ppd.
    #[arg(long = "kind", value_name = "KIND")]
    pub kinds: Vec<Kind>,
}

impl IngestArgs {
    fn source(&self) -> IngestSource {
        if self.archive {
            IngestSource::Archive
        } else {
            IngestSource::Daily(self.date.unwrap_or_else(pipeline::yesterday))
        }
    }
}

#[derive(Debug, Serialize)]
struct IngestOutput {
    source: String,
    #[serde(flatten)]
    report: RunReport<KindIngest>,
    summary: Summary,
}

fn describe(source: IngestSource) -> String {
    match source {
        IngestSource::Daily(date) => format!("daily {date}"),
        IngestSource::Archive => "archive".to_string(),
    }
}

fn summarize(report: &RunReport<KindIngest>) -> Summary {
    let skipped = report
        .outcomes
        .iter()
        .filter(|o| o.status == IngestStatus::NoSourceFiles)
        .count();
    Summary {
        processed: report.outcomes.len() - skipped,
        skipped,
        failed: report.failures.len(),
    }
}

/// Normalize raw files of the selected kinds into the store.
///
/// # Errors
///
/// Returns an error after rendering the report if any kind failed.
pub fn run_ingest(args: &IngestArgs, output: OutputMode, ws: &Workspace) -> Result<()> {
    let source = args.source();
    let report = pipeline::run_ingest(ws, &selected_kinds(&args.kinds), source);
    let payload = IngestOutput {
        source: describe(source),
        summary: summarize(&report),
        report,
    };

    render_mode(output, &payload, render_ingest_text, render_ingest_pretty)?;
    payload.summary.into_result("ingest")
}

fn render_ingest_text(payload: &IngestOutput, w: &mut dyn Write) -> io::Result<()> {
    for outcome in &payload.report.outcomes {
        match (&outcome.status, &outcome.report) {
            (IngestStatus::Ingested, Some(report)) => writeln!(
                w,
                "OK   {:<4} files={} read={} dropped={} duplicates={} partitions={}",
                outcome.kind,
                outcome.files,
                outcome.rows_read,
                outcome.rows_dropped,
                report.duplicates_removed,
                report.partitions.len()
            )?,
            (IngestStatus::Ingested, None) => {
                writeln!(w, "OK   {:<4} files={} read=0", outcome.kind, outcome.files)?;
            }
            (IngestStatus::NoSourceFiles, _) => {
                writeln!(w, "SKIP {:<4} no source files", outcome.kind)?;
            }
        }
        for path in &outcome.unreadable_files {
            writeln!(w, "WARN {:<4} unreadable {}", outcome.kind, path.display())?;
        }
    }
    write_failures(w, &payload.report.failures)?;
    payload.summary.write(w, "ingest")
}

fn render_ingest_pretty(payload: &IngestOutput, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("Ingest ({})", payload.source))?;
    for outcome in &payload.report.outcomes {
        if outcome.status == IngestStatus::NoSourceFiles {
            pretty_kv(w, &outcome.kind.to_string(), "skipped, no source files")?;
            continue;
        }
        let stored = outcome.report.as_ref().map_or_else(String::new, |r| {
            format!(
                ", {} duplicate(s) removed, {} partition(s) rewritten",
                r.duplicates_removed,
                r.partitions.len()
            )
        });
        pretty_kv(
            w,
            &outcome.kind.to_string(),
            format!(
                "{} file(s), {} row(s) read, {} dropped{stored}",
                outcome.files, outcome.rows_read, outcome.rows_dropped
            ),
        )?;
        for path in &outcome.unreadable_files {
            writeln!(w, "{:<14} unreadable: {}", "", path.display())?;
        }
    }
    writeln!(w)?;
    write_failures(w, &payload.report.failures)?;
    payload.summary.write(w, "ingest")
}

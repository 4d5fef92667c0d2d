use std::io::{self, Write};

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use subtally_core::error::ErrorCode;
use subtally_core::pipeline::{self, RunReport, Workspace};
use subtally_core::schema::Kind;
use subtally_core::store::KindValidation;

use crate::cmd::selected_kinds;
use crate::output::{OutputMode, Summary, pretty_kv, pretty_section, render_mode, write_failures};

/// Arguments for `subtally validate`.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Restrict to one transaction kind (repeatable).
    #[arg(long = "kind", value_name = "KIND")]
    pub kinds: Vec<Kind>,
}

#[derive(Debug, Serialize)]
struct ValidateOutput {
    #[serde(flatten)]
    report: RunReport<KindValidation>,
    summary: Summary,
}

fn join(columns: &std::collections::BTreeSet<String>) -> String {
    columns.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Report row counts, date ranges, duplicates and schema drift per kind.
///
/// Findings are informational; only kinds whose store cannot be listed count
/// as failures.
///
/// # Errors
///
/// Returns an error after rendering the report if any kind failed.
pub fn run_validate(args: &ValidateArgs, output: OutputMode, ws: &Workspace) -> Result<()> {
    let report = pipeline::run_validate(ws, &selected_kinds(&args.kinds));
    let skipped = report
        .outcomes
        .iter()
        .filter(|v| v.partitions.is_empty())
        .count();
    let payload = ValidateOutput {
        summary: Summary {
            processed: report.outcomes.len() - skipped,
            skipped,
            failed: report.failures.len(),
        },
        report,
    };

    render_mode(output, &payload, render_validate_text, render_validate_pretty)?;
    payload.summary.into_result("validate")
}

fn render_validate_text(payload: &ValidateOutput, w: &mut dyn Write) -> io::Result<()> {
    for v in &payload.report.outcomes {
        if v.partitions.is_empty() {
            writeln!(w, "SKIP {:<4} empty", v.kind)?;
            continue;
        }
        let range = v
            .date_range
            .map_or_else(|| "-".to_string(), |(a, b)| format!("{a}..{b}"));
        writeln!(
            w,
            "OK   {:<4} rows={} bytes={} partitions={} range={range} duplicates={}",
            v.kind,
            v.total_rows,
            v.total_bytes,
            v.partitions.len(),
            v.duplicate_keys
        )?;
        if v.has_schema_drift() {
            writeln!(
                w,
                "WARN {:<4} [{}] missing=[{}] extra=[{}]",
                v.kind,
                ErrorCode::SchemaDrift,
                join(&v.missing_columns),
                join(&v.extra_columns)
            )?;
        }
        for file in &v.unreadable {
            writeln!(w, "WARN {:<4} unreadable {} ({})", v.kind, file.path.display(), file.error)?;
        }
    }
    write_failures(w, &payload.report.failures)?;
    payload.summary.write(w, "validate")
}

fn render_validate_pretty(payload: &ValidateOutput, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, "Store validation")?;
    for v in &payload.report.outcomes {
        writeln!(w, "{}", v.kind)?;
        if v.partitions.is_empty() {
            pretty_kv(w, "  status", "empty")?;
            continue;
        }
        pretty_kv(w, "  rows", v.total_rows.to_string())?;
        pretty_kv(w, "  bytes", v.total_bytes.to_string())?;
        if let Some((first, last)) = v.date_range {
            pretty_kv(w, "  dates", format!("{first} .. {last}"))?;
        }
        pretty_kv(w, "  partitions", v.partitions.len().to_string())?;
        pretty_kv(w, "  duplicates", v.duplicate_keys.to_string())?;
        if !v.missing_columns.is_empty() {
            pretty_kv(w, "  missing", join(&v.missing_columns))?;
        }
        if !v.extra_columns.is_empty() {
            pretty_kv(w, "  extra", join(&v.extra_columns))?;
        }
        for file in &v.unreadable {
            pretty_kv(w, "  unreadable", format!("{} ({})", file.path.display(), file.error))?;
        }
    }
    writeln!(w)?;
    write_failures(w, &payload.report.failures)?;
    payload.summary.write(w, "validate")
}

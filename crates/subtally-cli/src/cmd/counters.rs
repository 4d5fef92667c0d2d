use std::io::{self, Write};

use anyhow::Result;
use chrono::NaiveDate;
use clap::Args;
use subtally_core::pipeline::{self, CountersRun, DateSelection, DayStatus, Workspace, yesterday};

use crate::output::{
    CliError, OutputMode, Summary, pretty_kv, pretty_section, render_error, render_mode,
    write_failures,
};

/// Arguments for `subtally counters`.
#[derive(Args, Debug)]
pub struct CountersArgs {
    /// Single date to build (YYYY-MM-DD). Defaults to yesterday.
    #[arg(value_name = "DATE", conflicts_with_all = ["start_date", "backfill"])]
    pub date: Option<NaiveDate>,

    /// First date of an inclusive range.
    #[arg(long, value_name = "DATE", requires = "end_date", conflicts_with = "backfill")]
    pub start_date: Option<NaiveDate>,

    /// Last date of an inclusive range.
    #[arg(long, value_name = "DATE", requires = "start_date")]
    pub end_date: Option<NaiveDate>,

    /// Build every store date missing from the per-code table.
    #[arg(long)]
    pub backfill: bool,

    /// Recompute dates that are already in the table.
    #[arg(long)]
    pub force: bool,
}

impl CountersArgs {
    fn selection(&self) -> Result<DateSelection> {
        if self.backfill {
            return Ok(DateSelection::Backfill);
        }
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => {
                if start > end {
                    anyhow::bail!("--start-date {start} is after --end-date {end}");
                }
                Ok(DateSelection::Range(start, end))
            }
            _ => Ok(DateSelection::Single(self.date.unwrap_or_else(yesterday))),
        }
    }
}

fn summarize(run: &CountersRun) -> Summary {
    let skipped = run
        .days
        .outcomes
        .iter()
        .filter(|d| d.status == DayStatus::AlreadyProcessed)
        .count();
    Summary {
        processed: run.days.outcomes.len() - skipped,
        skipped,
        failed: run.days.failures.len(),
    }
}

#[derive(Debug, serde::Serialize)]
struct CountersOutput {
    #[serde(flatten)]
    run: CountersRun,
    summary: Summary,
}

/// Build per-code counters for the selected dates and republish the
/// per-service table.
///
/// # Errors
///
/// Returns an error if the run cannot start (bad date range, unreadable
/// mapping or counter table) or after rendering the report if any date
/// failed.
pub fn run_counters(args: &CountersArgs, output: OutputMode, ws: &Workspace) -> Result<()> {
    let selection = args.selection()?;
    let run = match pipeline::run_counters(ws, selection, args.force, pipeline::stamp_now()) {
        Ok(run) => run,
        Err(err) => {
            render_error(output, &CliError::from(&err))?;
            return Err(err);
        }
    };
    let payload = CountersOutput {
        summary: summarize(&run),
        run,
    };

    render_mode(output, &payload, render_counters_text, render_counters_pretty)?;
    payload.summary.into_result("counters")
}

fn status_label(status: DayStatus) -> &'static str {
    match status {
        DayStatus::Built => "built",
        DayStatus::Empty => "empty",
        DayStatus::AlreadyProcessed => "already processed",
    }
}

fn render_counters_text(payload: &CountersOutput, w: &mut dyn Write) -> io::Result<()> {
    for day in &payload.run.days.outcomes {
        let tag = if day.status == DayStatus::AlreadyProcessed {
            "SKIP"
        } else {
            "OK  "
        };
        writeln!(
            w,
            "{tag} {} {} codes={} excluded={}",
            day.date,
            status_label(day.status),
            day.codes,
            day.excluded
        )?;
    }
    if !payload.run.unmapped.is_empty() {
        writeln!(w, "WARN {} unmapped code(s)", payload.run.unmapped.len())?;
    }
    write_failures(w, &payload.run.days.failures)?;
    payload.summary.write(w, "counters")
}

fn render_counters_pretty(payload: &CountersOutput, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, "Counters")?;
    for day in &payload.run.days.outcomes {
        let detail = match day.status {
            DayStatus::Built => format!(
                "{} code(s), {} excluded row(s)",
                day.codes, day.excluded
            ),
            DayStatus::Empty => "no transactions, date cleared".to_string(),
            DayStatus::AlreadyProcessed => "already processed (use --force)".to_string(),
        };
        pretty_kv(w, &day.date.to_string(), detail)?;
    }
    writeln!(w)?;
    pretty_kv(w, "table rows", payload.run.table_rows.to_string())?;
    pretty_kv(w, "services", payload.run.services.to_string())?;
    if !payload.run.unmapped.is_empty() {
        let shown: Vec<String> = payload
            .run
            .unmapped
            .iter()
            .take(20)
            .map(ToString::to_string)
            .collect();
        pretty_kv(w, "unmapped", shown.join(", "))?;
    }
    writeln!(w)?;
    write_failures(w, &payload.run.days.failures)?;
    payload.summary.write(w, "counters")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> CountersArgs {
        CountersArgs {
            date: None,
            start_date: None,
            end_date: None,
            backfill: false,
            force: false,
        }
    }

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn no_date_selects_yesterday() {
        assert_eq!(args().selection().unwrap(), DateSelection::Single(yesterday()));
    }

    #[test]
    fn range_and_backfill_selections() {
        let mut range = args();
        range.start_date = Some(d("2024-03-01"));
        range.end_date = Some(d("2024-03-03"));
        assert_eq!(
            range.selection().unwrap(),
            DateSelection::Range(d("2024-03-01"), d("2024-03-03"))
        );

        let mut backfill = args();
        backfill.backfill = true;
        assert_eq!(backfill.selection().unwrap(), DateSelection::Backfill);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut range = args();
        range.start_date = Some(d("2024-03-05"));
        range.end_date = Some(d("2024-03-01"));
        assert!(range.selection().is_err());
    }
}

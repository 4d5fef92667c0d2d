//! End-to-end: raw daily files -> store -> per-code counters -> per-service table.
//!
//! Each test builds an isolated project root in a temp directory and drives it
//! through the same `pipeline` entry points the CLI uses.

use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use subtally_core::config::ProjectConfig;
use subtally_core::counters::{self, DailyCounterRow};
use subtally_core::pipeline::{
    DateSelection, DayStatus, IngestSource, IngestStatus, Workspace, run_counters, run_ingest,
    stamp_now,
};
use subtally_core::schema::Kind;
use tempfile::TempDir;

const ACT_HEADER: &str = "tmuserid,msisdn,cpc,trans_type_id,channel_id,channel_act,trans_date,act_date,reno_date,camp_name,tef_prov,campana_medium,campana_id,subscription_id,rev";
const RFND_HEADER: &str = "tmuserid,cpc,refnd_date,rfnd_amount,rfnd_cnt,sbnid,instant_rfnd";
const MAPPING: &str = "\
Service Name,TME Category,Free_CPC,Free_Period,Upgrade_CPC,CHG_Period,CHG_Price,CPCs
Music Plus,MUSIC,,0,501,Monthly,4.99,{500}
Nubico Premium,BOOKS,,0,,Monthly,9.99,{200}
";

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 5).expect("valid date")
}

fn act(sub: i64, cpc: i64, channel: &str, time: &str, rev: &str) -> String {
    format!("tm{sub},34600{sub:06},{cpc},1,1,{channel},2024-03-05 {time},,,,,,,{sub},{rev}")
}

fn write_lines(path: &Path, header: &str, lines: &[String]) {
    let mut body = String::from(header);
    for line in lines {
        body.push('\n');
        body.push_str(line);
    }
    body.push('\n');
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, body).expect("write raw file");
}

fn project() -> (TempDir, Workspace) {
    let dir = TempDir::new().expect("tempdir");
    let ws = Workspace::from_config(dir.path(), &ProjectConfig::default());
    fs::write(&ws.paths.mapping, MAPPING).expect("write mapping");

    write_lines(
        &ws.paths.daily.join("act_atlas_20240305.csv"),
        ACT_HEADER,
        &[
            act(1, 500, "WEB", "08:00:00", "4.99"),
            act(2, 500, "UPGRADE", "09:00:00", "4.99"),
            act(3, 500, "WEB", "10:00:00", "0"),
            act(4, 999, "WEB", "11:00:00", "2.50"),
            act(5, 200, "WEB", "12:00:00", "7.00"),
        ],
    );
    write_lines(
        &ws.paths.daily.join("rfnd_atlas_20240305.csv"),
        RFND_HEADER,
        &["tm1,500,2024-03-05 13:00:00,9.99,1,1,N".to_string()],
    );
    (dir, ws)
}

fn ingest_and_count(ws: &Workspace) -> Vec<DailyCounterRow> {
    let ingest = run_ingest(ws, &Kind::ALL, IngestSource::Daily(day()));
    assert!(ingest.is_success(), "ingest failures: {:?}", ingest.failures);

    let run = run_counters(ws, DateSelection::Single(day()), false, stamp_now()).expect("counters");
    assert!(run.is_success(), "counter failures: {:?}", run.days.failures);
    counters::load_code_table(&ws.counters.code_table).expect("load table")
}

#[test]
fn single_day_scenario_produces_expected_code_row() {
    let (_dir, ws) = project();
    let table = ingest_and_count(&ws);

    let row = table.iter().find(|r| r.cpc == 500).expect("row for 500");
    assert_eq!(row.date, day());
    assert_eq!(row.act_count, 3);
    assert_eq!(row.act_free, 1);
    assert_eq!(row.act_pay, 2);
    assert_eq!(row.upg_count, 1);
    assert_eq!(row.rfnd_count, 1);
    assert!((row.rfnd_amount - 9.99).abs() < 1e-9);
    assert!((row.rev - 9.98).abs() < 1e-9);
    assert_ne!(row.last_updated, counters::zero_timestamp());

    for row in &table {
        assert_eq!(row.act_free + row.act_pay, row.act_count);
        assert!(row.upg_count <= row.act_count);
    }
}

#[test]
fn kinds_without_daily_files_are_skipped() {
    let (_dir, ws) = project();
    let ingest = run_ingest(&ws, &Kind::ALL, IngestSource::Daily(day()));
    assert!(ingest.is_success());
    let skipped: Vec<Kind> = ingest
        .outcomes
        .iter()
        .filter(|o| o.status == IngestStatus::NoSourceFiles)
        .map(|o| o.kind)
        .collect();
    assert_eq!(
        skipped,
        vec![
            Kind::Renewal,
            Kind::Deactivation,
            Kind::Cancellation,
            Kind::OneTimePurchase
        ]
    );
}

#[test]
fn service_table_keeps_unmapped_and_drops_denylisted() {
    let (_dir, ws) = project();
    let table = ingest_and_count(&ws);

    let text = fs::read_to_string(&ws.counters.service_table).expect("service table");
    assert!(!text.to_lowercase().contains("nubico"));

    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let headers = reader.headers().expect("header").clone();
    let col = |name: &str| headers.iter().position(|h| h == name).expect("column");
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.expect("row")).collect();

    let services: Vec<&str> = rows.iter().map(|r| &r[col("service_name")]).collect();
    assert_eq!(services, vec!["Music Plus", "UNKNOWN"]);
    assert_eq!(&rows[0][col("cpcs")], "500");
    assert_eq!(&rows[1][col("cpcs")], "999");
    assert_eq!(&rows[1][col("tme_category")], "");

    // UNKNOWN plus mapped services carry every non-denylisted code's revenue.
    let published: f64 = rows
        .iter()
        .map(|r| r[col("rev")].parse::<f64>().expect("rev"))
        .sum();
    let denied: f64 = table.iter().filter(|r| r.cpc == 200).map(|r| r.rev).sum();
    let total: f64 = table.iter().map(|r| r.rev).sum();
    assert!((published - (total - denied)).abs() < 1e-6);
}

#[test]
fn rerunning_a_day_is_idempotent() {
    let (_dir, ws) = project();
    let first = ingest_and_count(&ws);

    // Re-ingesting the same files must not duplicate anything.
    let again = run_ingest(&ws, &Kind::ALL, IngestSource::Daily(day()));
    let act = again
        .outcomes
        .iter()
        .find(|o| o.kind == Kind::Activation)
        .and_then(|o| o.report.as_ref())
        .expect("activation report");
    assert_eq!(act.duplicates_removed, 5);

    let skipped = run_counters(&ws, DateSelection::Single(day()), false, stamp_now()).expect("run");
    assert_eq!(skipped.days.outcomes[0].status, DayStatus::AlreadyProcessed);

    let forced = run_counters(&ws, DateSelection::Single(day()), true, stamp_now()).expect("run");
    assert_eq!(forced.days.outcomes[0].status, DayStatus::Built);
    let second = counters::load_code_table(&ws.counters.code_table).expect("table");

    let strip = |rows: &[DailyCounterRow]| {
        rows.iter()
            .map(|r| {
                let mut r = r.clone();
                r.last_updated = counters::zero_timestamp();
                r
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(strip(&first), strip(&second));
}

#[test]
fn excluded_users_are_left_out_of_counters_only() {
    let (_dir, ws) = project();
    fs::write(&ws.paths.excluded_users, "msisdn\n34600000001\n").expect("write exclusions");
    let table = ingest_and_count(&ws);

    let row = table.iter().find(|r| r.cpc == 500).expect("row");
    assert_eq!(row.act_count, 2);
    // the refund belongs to tm1, whose msisdn is unknown on refund rows
    assert_eq!(row.rfnd_count, 1);

    let stored = ws.store.read_date(Kind::Activation, day()).expect("read");
    assert_eq!(stored.len(), 5);
}

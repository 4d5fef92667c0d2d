//! Service Aggregator: per-code counters rolled up per commercial service.
//!
//! The whole historical per-code table is joined against the
//! [`CodeMapping`] and regrouped by `(date, service, category)`. Codes the
//! mapping does not know keep their counts under the unknown sentinel and are
//! listed separately, so no revenue disappears. Services rejected by the
//! [`ServiceFilter`] are dropped before grouping.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::atomic;
use crate::counters::{CounterError, DailyCounterRow, round_cents};
use crate::mapping::{CodeMapping, ServiceInfo};

/// Decides which services are left out of commercial counting.
pub trait ServiceFilter {
    fn excludes(&self, service: &ServiceInfo) -> bool;
}

/// Excludes services whose name contains any configured substring,
/// ignoring case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenylistPolicy {
    needles: Vec<String>,
}

impl DenylistPolicy {
    #[must_use]
    pub fn new<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            needles: needles
                .into_iter()
                .map(|n| n.as_ref().trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn is_denied(&self, service_name: &str) -> bool {
        let name = service_name.to_lowercase();
        self.needles.iter().any(|n| name.contains(n.as_str()))
    }
}

impl ServiceFilter for DenylistPolicy {
    fn excludes(&self, service: &ServiceInfo) -> bool {
        self.is_denied(&service.service_name)
    }
}

/// One `(date, service, category)` group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceAggregateRow {
    pub date: NaiveDate,
    pub service_name: String,
    pub tme_category: String,
    pub cpcs: Vec<i64>,
    pub free_cpc: i64,
    pub free_period: i64,
    pub upgrade_cpc: i64,
    pub chg_period: i64,
    pub chg_price: f64,
    pub act_count: i64,
    pub act_free: i64,
    pub act_pay: i64,
    pub upg_count: i64,
    pub reno_count: i64,
    pub dct_count: i64,
    pub upg_dct_count: i64,
    pub cnr_count: i64,
    pub ppd_count: i64,
    pub rfnd_count: i64,
    pub rfnd_amount: f64,
    pub rev: f64,
}

impl ServiceAggregateRow {
    fn start(date: NaiveDate, service: &ServiceInfo) -> Self {
        Self {
            date,
            service_name: service.service_name.clone(),
            tme_category: service.tme_category.clone(),
            cpcs: Vec::new(),
            free_cpc: service.free_cpc,
            free_period: service.free_period,
            upgrade_cpc: service.upgrade_cpc,
            chg_period: service.chg_period,
            chg_price: service.chg_price,
            act_count: 0,
            act_free: 0,
            act_pay: 0,
            upg_count: 0,
            reno_count: 0,
            dct_count: 0,
            upg_dct_count: 0,
            cnr_count: 0,
            ppd_count: 0,
            rfnd_count: 0,
            rfnd_amount: 0.0,
            rev: 0.0,
        }
    }

    fn add(&mut self, row: &DailyCounterRow) {
        self.cpcs.push(row.cpc);
        self.act_count += row.act_count;
        self.act_free += row.act_free;
        self.act_pay += row.act_pay;
        self.upg_count += row.upg_count;
        self.reno_count += row.reno_count;
        self.dct_count += row.dct_count;
        self.upg_dct_count += row.upg_dct_count;
        self.cnr_count += row.cnr_count;
        self.ppd_count += row.ppd_count;
        self.rfnd_count += row.rfnd_count;
        self.rfnd_amount += row.rfnd_amount;
        self.rev += row.rev;
    }

    /// Contributing codes rendered for interchange: `"100, 101"`.
    #[must_use]
    pub fn cpcs_label(&self) -> String {
        self.cpcs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Result of [`aggregate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceAggregation {
    pub rows: Vec<ServiceAggregateRow>,
    /// Codes with counters but no mapping entry, ascending.
    pub unmapped: Vec<i64>,
    /// Per-code rows dropped by the service filter.
    pub filtered_rows: usize,
}

/// Group `counters` by service. Static pricing attributes come from the
/// lowest contributing code's mapping entry.
#[must_use]
pub fn aggregate(
    counters: &[DailyCounterRow],
    mapping: &CodeMapping,
    filter: &impl ServiceFilter,
    unknown_name: &str,
) -> ServiceAggregation {
    let unknown = ServiceInfo::unknown(unknown_name);
    let mut unmapped = BTreeSet::new();
    let mut filtered_rows = 0usize;
    let mut groups: BTreeMap<(NaiveDate, String, String), ServiceAggregateRow> = BTreeMap::new();

    let mut ordered: Vec<&DailyCounterRow> = counters.iter().collect();
    ordered.sort_by_key(|r| (r.date, r.cpc));

    for row in ordered {
        let service = mapping.get(row.cpc).unwrap_or_else(|| {
            unmapped.insert(row.cpc);
            &unknown
        });
        if filter.excludes(service) {
            filtered_rows += 1;
            continue;
        }
        groups
            .entry((
                row.date,
                service.service_name.clone(),
                service.tme_category.clone(),
            ))
            .or_insert_with(|| ServiceAggregateRow::start(row.date, service))
            .add(row);
    }

    let rows = groups
        .into_values()
        .map(|mut group| {
            group.cpcs.sort_unstable();
            group.cpcs.dedup();
            group.rev = round_cents(group.rev);
            group.rfnd_amount = round_cents(group.rfnd_amount);
            group
        })
        .collect();
    let unmapped: Vec<i64> = unmapped.into_iter().collect();
    if !unmapped.is_empty() {
        warn!(
            count = unmapped.len(),
            codes = ?unmapped.iter().take(20).collect::<Vec<_>>(),
            "billing codes missing from the code mapping"
        );
    }
    ServiceAggregation {
        rows,
        unmapped,
        filtered_rows,
    }
}

/// Column header of the published per-service table.
pub const SERVICE_TABLE_HEADER: [&str; 21] = [
    "date",
    "service_name",
    "tme_category",
    "cpcs",
    "Free_CPC",
    "Free_Period",
    "Upgrade_CPC",
    "CHG_Period",
    "CHG_Price",
    "act_count",
    "act_free",
    "act_pay",
    "upg_count",
    "reno_count",
    "dct_count",
    "upg_dct_count",
    "cnr_count",
    "ppd_count",
    "rfnd_count",
    "rfnd_amount",
    "rev",
];

/// Publish the per-service table as CSV, atomically.
///
/// # Errors
///
/// Returns [`CounterError::Write`] if the file cannot be written; the
/// previous table is left in place.
pub fn write_service_table(path: &Path, rows: &[ServiceAggregateRow]) -> Result<(), CounterError> {
    atomic::write_atomic_with(path, |out| {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(SERVICE_TABLE_HEADER)?;
        for row in rows {
            writer.write_record([
                row.date.format("%Y-%m-%d").to_string(),
                row.service_name.clone(),
                row.tme_category.clone(),
                row.cpcs_label(),
                row.free_cpc.to_string(),
                row.free_period.to_string(),
                row.upgrade_cpc.to_string(),
                row.chg_period.to_string(),
                format!("{:.2}", row.chg_price),
                row.act_count.to_string(),
                row.act_free.to_string(),
                row.act_pay.to_string(),
                row.upg_count.to_string(),
                row.reno_count.to_string(),
                row.dct_count.to_string(),
                row.upg_dct_count.to_string(),
                row.cnr_count.to_string(),
                row.ppd_count.to_string(),
                row.rfnd_count.to_string(),
                format!("{:.2}", row.rfnd_amount),
                format!("{:.2}", row.rev),
            ])?;
        }
        writer.flush()
    })?;
    info!(path = %path.display(), rows = rows.len(), "wrote per-service counters");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::CodeMappingEntry;
    use std::fs;
    use tempfile::TempDir;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, n).unwrap()
    }

    fn counter(d: u32, cpc: i64, rev: f64) -> DailyCounterRow {
        let mut row = DailyCounterRow::zero(day(d), cpc);
        row.act_count = 1;
        row.act_pay = 1;
        row.rev = rev;
        row
    }

    fn entry(cpc: i64, name: &str, category: &str) -> CodeMappingEntry {
        let mut service = ServiceInfo::unknown(name);
        service.tme_category = category.to_string();
        service.chg_price = 4.99;
        CodeMappingEntry { cpc, service }
    }

    fn mapping() -> CodeMapping {
        [
            entry(100, "Music Plus", "MUSIC"),
            entry(101, "Music Plus", "MUSIC"),
            entry(200, "Nubico Premium", "BOOKS"),
        ]
        .into_iter()
        .collect()
    }

    fn policy() -> DenylistPolicy {
        DenylistPolicy::new(["nubico", "movistar apple music"])
    }

    #[test]
    fn codes_of_one_service_roll_up_together() {
        let counters = vec![counter(1, 101, 2.0), counter(1, 100, 1.5), counter(2, 100, 1.0)];
        let out = aggregate(&counters, &mapping(), &policy(), "UNKNOWN");
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0].cpcs, vec![100, 101]);
        assert_eq!(out.rows[0].cpcs_label(), "100, 101");
        assert_eq!(out.rows[0].act_count, 2);
        assert!((out.rows[0].rev - 3.5).abs() < 1e-9);
        assert!((out.rows[0].chg_price - 4.99).abs() < 1e-9);
        assert_eq!(out.rows[1].date, day(2));
    }

    #[test]
    fn unmapped_codes_keep_their_revenue() {
        let counters = vec![counter(1, 100, 1.25), counter(1, 999, 3.0), counter(1, 998, 0.5)];
        let out = aggregate(&counters, &mapping(), &policy(), "UNKNOWN");
        assert_eq!(out.unmapped, vec![998, 999]);
        let unknown = out.rows.iter().find(|r| r.service_name == "UNKNOWN").unwrap();
        assert_eq!(unknown.tme_category, "");
        assert_eq!(unknown.chg_price, 0.0);
        let total: f64 = out.rows.iter().map(|r| r.rev).sum();
        assert!((total - 4.75).abs() < 1e-9);
    }

    #[test]
    fn denylisted_services_never_appear() {
        let counters = vec![counter(1, 200, 50.0)];
        let out = aggregate(&counters, &mapping(), &policy(), "UNKNOWN");
        assert!(out.rows.is_empty());
        assert_eq!(out.filtered_rows, 1);
        assert!(policy().is_denied("MOVISTAR Apple Music Family"));
        assert!(!policy().is_denied("Apple TV"));
    }

    #[test]
    fn service_table_is_written_with_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counters_service.csv");
        let out = aggregate(&[counter(1, 100, 1.5)], &mapping(), &policy(), "UNKNOWN");
        write_service_table(&path, &out.rows).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), SERVICE_TABLE_HEADER.join(","));
        assert_eq!(
            lines.next().unwrap(),
            "2024-02-01,Music Plus,MUSIC,100,0,0,0,0,4.99,1,0,1,0,0,0,0,0,0,0,0.00,1.50"
        );
    }
}

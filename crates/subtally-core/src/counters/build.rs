//! Counter Builder: one date of the store rolled up per billing code.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use super::{DailyCounterRow, round_cents};
use crate::exclusions::ExcludedSubjects;
use crate::record::TransactionRecord;
use crate::schema::Kind;
use crate::store::{PartitionStore, StoreError};

/// Rows built for one date plus the input volumes behind them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayTally {
    pub date: NaiveDate,
    pub rows: Vec<DailyCounterRow>,
    /// Records read per kind, before exclusions.
    pub records: BTreeMap<Kind, usize>,
    pub excluded: usize,
    /// Records without a billing code; they cannot be attributed.
    pub uncoded: usize,
}

impl DayTally {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read every kind for `date` from the store and tally it.
///
/// # Errors
///
/// Returns [`StoreError`] if a partition holding `date` cannot be read.
pub fn build_day(
    store: &PartitionStore,
    date: NaiveDate,
    exclusions: &ExcludedSubjects,
    upgrade_channel: &str,
) -> Result<DayTally, StoreError> {
    let mut by_kind = Vec::with_capacity(Kind::ALL.len());
    for kind in Kind::ALL {
        let records = store.read_date(kind, date)?;
        debug!(kind = %kind, date = %date, records = records.len(), "loaded day");
        by_kind.push((kind, records));
    }
    let tally = tally(date, &by_kind, exclusions, upgrade_channel);
    info!(
        date = %date,
        codes = tally.rows.len(),
        excluded = tally.excluded,
        "built daily counters"
    );
    Ok(tally)
}

/// Tally already-loaded records of `date`. Records dated otherwise are
/// ignored. A kind with no records contributes zero to every code. Output
/// rows are sorted by code and carry a zero `last_updated`; the merger
/// stamps them.
#[must_use]
pub fn tally(
    date: NaiveDate,
    by_kind: &[(Kind, Vec<TransactionRecord>)],
    exclusions: &ExcludedSubjects,
    upgrade_channel: &str,
) -> DayTally {
    let mut rows: BTreeMap<i64, DailyCounterRow> = BTreeMap::new();
    let mut records = BTreeMap::new();
    let mut excluded = 0usize;
    let mut uncoded = 0usize;

    for (kind, batch) in by_kind {
        *records.entry(*kind).or_insert(0) += batch.len();
        for record in batch.iter().filter(|r| r.event_date() == date) {
            if exclusions.excludes(record) {
                excluded += 1;
                continue;
            }
            let Some(cpc) = record.cpc() else {
                uncoded += 1;
                continue;
            };
            let row = rows
                .entry(cpc)
                .or_insert_with(|| DailyCounterRow::zero(date, cpc));
            count(row, record, upgrade_channel);
        }
    }

    let rows = rows
        .into_values()
        .map(|mut row| {
            row.rev = round_cents(row.rev);
            row.rfnd_amount = round_cents(row.rfnd_amount);
            row
        })
        .collect();
    DayTally {
        date,
        rows,
        records,
        excluded,
        uncoded,
    }
}

fn count(row: &mut DailyCounterRow, record: &TransactionRecord, upgrade_channel: &str) {
    let upgrade = record.channel() == Some(upgrade_channel);
    match record {
        TransactionRecord::Activation(tx) => {
            row.act_count += 1;
            if tx.rev.is_some_and(|r| r > 0.0) {
                row.act_pay += 1;
            } else {
                row.act_free += 1;
            }
            if upgrade {
                row.upg_count += 1;
            }
        }
        TransactionRecord::Renewal(_) => row.reno_count += 1,
        TransactionRecord::Deactivation(_) => {
            row.dct_count += 1;
            if upgrade {
                row.upg_dct_count += 1;
            }
        }
        TransactionRecord::Cancellation(_) => row.cnr_count += 1,
        TransactionRecord::OneTimePurchase(_) => row.ppd_count += 1,
        TransactionRecord::Refund(tx) => {
            row.rfnd_count += tx.rfnd_cnt.unwrap_or(1);
            row.rfnd_amount += tx.rfnd_amount.unwrap_or(0.0);
        }
    }
    if let Some(rev) = record.rev() {
        row.rev += rev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::{activation, refund, subscription};
    use crate::record::{CancellationTx, TransactionRecord};
    use crate::record::fixtures::ts;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
    }

    fn upgraded(mut record: TransactionRecord) -> TransactionRecord {
        if let TransactionRecord::Activation(tx) | TransactionRecord::Deactivation(tx) = &mut record {
            tx.channel_act = Some("UPGRADE".into());
            tx.channel_dct = Some("UPGRADE".into());
        }
        record
    }

    #[test]
    fn activation_splits_are_additive() {
        let acts = vec![
            activation("2024-03-05 09:00:00", 1, 500, 4.99),
            upgraded(activation("2024-03-05 10:00:00", 2, 500, 4.99)),
            activation("2024-03-05 11:00:00", 3, 500, 0.0),
        ];
        let refunds = vec![refund("2024-03-05 12:00:00", 1, 500, 9.99)];
        let tally = tally(
            day(),
            &[(Kind::Activation, acts), (Kind::Refund, refunds)],
            &ExcludedSubjects::default(),
            "UPGRADE",
        );

        assert_eq!(tally.rows.len(), 1);
        let row = &tally.rows[0];
        assert_eq!(row.cpc, 500);
        assert_eq!(row.act_count, 3);
        assert_eq!(row.act_free, 1);
        assert_eq!(row.act_pay, 2);
        assert_eq!(row.upg_count, 1);
        assert_eq!(row.rfnd_count, 1);
        assert!((row.rfnd_amount - 9.99).abs() < 1e-9);
        assert!((row.rev - 9.98).abs() < 1e-9);
    }

    #[test]
    fn deactivation_upgrade_subset_and_missing_rev_is_free() {
        let mut no_rev = subscription("2024-03-05 08:00:00", 9, 7);
        no_rev.rev = None;
        let dct = subscription("2024-03-05 08:00:00", 10, 7);
        let tally = tally(
            day(),
            &[
                (Kind::Activation, vec![TransactionRecord::Activation(no_rev)]),
                (
                    Kind::Deactivation,
                    vec![
                        upgraded(TransactionRecord::Deactivation(dct.clone())),
                        TransactionRecord::Deactivation(dct),
                    ],
                ),
            ],
            &ExcludedSubjects::default(),
            "UPGRADE",
        );
        let row = &tally.rows[0];
        assert_eq!((row.act_count, row.act_free, row.act_pay), (1, 1, 0));
        assert_eq!((row.dct_count, row.upg_dct_count), (2, 1));
    }

    #[test]
    fn null_refund_count_counts_once_and_codes_are_sorted() {
        let mut r = refund("2024-03-05 00:00:00", 4, 900, 1.5);
        if let TransactionRecord::Refund(tx) = &mut r {
            tx.rfnd_cnt = None;
        }
        let cnr = TransactionRecord::Cancellation(CancellationTx {
            cancel_date: ts("2024-03-05 01:00:00"),
            sbn_id: Some(4),
            tmuserid: None,
            cpc: Some(100),
            mode: None,
        });
        let tally = tally(
            day(),
            &[(Kind::Refund, vec![r]), (Kind::Cancellation, vec![cnr])],
            &ExcludedSubjects::default(),
            "UPGRADE",
        );
        let codes: Vec<i64> = tally.rows.iter().map(|r| r.cpc).collect();
        assert_eq!(codes, vec![100, 900]);
        assert_eq!(tally.rows[0].cnr_count, 1);
        assert_eq!(tally.rows[1].rfnd_count, 1);
    }

    #[test]
    fn exclusions_and_uncoded_rows_are_left_out() {
        let mut uncoded = subscription("2024-03-05 08:00:00", 2, 0);
        uncoded.cpc = None;
        let excluded = ExcludedSubjects::new(vec!["34600000001".to_string()], Vec::new());
        let tally = tally(
            day(),
            &[(
                Kind::Renewal,
                vec![
                    TransactionRecord::Renewal(subscription("2024-03-05 08:00:00", 1, 5)),
                    TransactionRecord::Renewal(uncoded),
                ],
            )],
            &excluded,
            "UPGRADE",
        );
        assert!(tally.is_empty());
        assert_eq!(tally.excluded, 1);
        assert_eq!(tally.uncoded, 1);
        assert_eq!(tally.records[&Kind::Renewal], 2);
    }
}

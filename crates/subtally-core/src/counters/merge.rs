//! Counter Merger: replace one date in the historical per-code table.

use chrono::{NaiveDate, NaiveDateTime};

use super::{DailyCounterRow, round_cents};

/// Drop every `existing` row dated `date`, append `new_rows` stamped with
/// `now`, and sort by `(date, cpc)`.
///
/// `new_rows` may be empty, in which case `date` simply disappears from the
/// table. Rows of `new_rows` dated otherwise are re-dated to `date`. Money
/// fields of historical rows are re-rounded so old tables converge on the
/// current precision.
#[must_use]
pub fn merge(
    existing: Vec<DailyCounterRow>,
    new_rows: Vec<DailyCounterRow>,
    date: NaiveDate,
    now: NaiveDateTime,
) -> Vec<DailyCounterRow> {
    let mut merged: Vec<DailyCounterRow> = existing
        .into_iter()
        .filter(|row| row.date != date)
        .map(|mut row| {
            row.rev = round_cents(row.rev);
            row.rfnd_amount = round_cents(row.rfnd_amount);
            row
        })
        .collect();
    merged.extend(new_rows.into_iter().map(|mut row| {
        row.date = date;
        row.last_updated = now;
        row
    }));
    merged.sort_by_key(|row| (row.date, row.cpc));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, n).unwrap()
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn row(d: u32, cpc: i64, act: i64) -> DailyCounterRow {
        let mut row = DailyCounterRow::zero(day(d), cpc);
        row.act_count = act;
        row.act_pay = act;
        row
    }

    #[test]
    fn replaces_only_the_target_date() {
        let existing = vec![row(1, 10, 1), row(2, 10, 5), row(2, 11, 5), row(3, 10, 1)];
        let merged = merge(existing, vec![row(2, 12, 7)], day(2), at("2024-01-04 00:00:00"));
        let keys: Vec<(NaiveDate, i64, i64)> =
            merged.iter().map(|r| (r.date, r.cpc, r.act_count)).collect();
        assert_eq!(
            keys,
            vec![(day(1), 10, 1), (day(2), 12, 7), (day(3), 10, 1)]
        );
        assert_eq!(merged[1].last_updated, at("2024-01-04 00:00:00"));
        assert_eq!(merged[0].last_updated, DailyCounterRow::zero(day(1), 0).last_updated);
    }

    #[test]
    fn merging_the_same_day_twice_is_stable() {
        let history = vec![row(1, 10, 1), row(3, 10, 1)];
        let day_rows = vec![row(2, 10, 4), row(2, 20, 1)];
        let once = merge(history, day_rows.clone(), day(2), at("2024-01-05 00:00:00"));
        let twice = merge(once.clone(), day_rows, day(2), at("2024-01-06 00:00:00"));

        let strip = |rows: &[DailyCounterRow]| {
            rows.iter()
                .map(|r| {
                    let mut r = r.clone();
                    r.last_updated = NaiveDateTime::default();
                    r
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&once), strip(&twice));
    }

    #[test]
    fn empty_day_removes_the_date() {
        let merged = merge(vec![row(1, 10, 1), row(2, 10, 1)], Vec::new(), day(2), at("2024-01-03 00:00:00"));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].date, day(1));
    }
}

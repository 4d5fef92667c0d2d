//! Gap detection between the store and the raw archive.
//!
//! A date is missing when it lies inside the store's own `[min, max]` range
//! but has no rows. Archive dates past the store maximum are unprocessed
//! data, not gaps. Missing dates are coalesced into runs of consecutive days.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;

use crate::schema::Kind;

/// An inclusive run of consecutive dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    #[must_use]
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn dates(self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// Gap analysis for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapReport {
    pub kind: Kind,
    pub store_range: (NaiveDate, NaiveDate),
    pub store_dates: usize,
    pub archive_range: Option<(NaiveDate, NaiveDate)>,
    pub missing: Vec<NaiveDate>,
    pub ranges: Vec<DateRange>,
    /// Missing dates the archive actually has rows for.
    pub recoverable: Vec<NaiveDate>,
}

/// Why a kind was not analysed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSkip {
    EmptyStore,
    EmptyArchive,
}

/// Coalesce ascending dates into maximal runs of consecutive days.
#[must_use]
pub fn coalesce(dates: &[NaiveDate]) -> Vec<DateRange> {
    let mut ranges: Vec<DateRange> = Vec::new();
    for &date in dates {
        match ranges.last_mut() {
            Some(current) if current.end.succ_opt() == Some(date) => current.end = date,
            _ => ranges.push(DateRange {
                start: date,
                end: date,
            }),
        }
    }
    ranges
}

/// Dates in `[min(store), max(store)]` that are absent from `store`.
#[must_use]
pub fn missing_dates(store: &BTreeSet<NaiveDate>) -> Vec<NaiveDate> {
    let (Some(&first), Some(&last)) = (store.first(), store.last()) else {
        return Vec::new();
    };
    first
        .iter_days()
        .take_while(|d| *d <= last)
        .filter(|d| !store.contains(d))
        .collect()
}

/// Compare store coverage with archive coverage for `kind`.
///
/// # Errors
///
/// Returns a [`GapSkip`] when the store or the archive has no dates for the
/// kind; the kind is then skipped rather than treated as fully missing.
pub fn detect(
    kind: Kind,
    store: &BTreeSet<NaiveDate>,
    archive: &BTreeSet<NaiveDate>,
) -> Result<GapReport, GapSkip> {
    let (Some(&store_min), Some(&store_max)) = (store.first(), store.last()) else {
        return Err(GapSkip::EmptyStore);
    };
    let (Some(&archive_min), Some(&archive_max)) = (archive.first(), archive.last()) else {
        return Err(GapSkip::EmptyArchive);
    };

    let missing = missing_dates(store);
    let ranges = coalesce(&missing);
    let recoverable = missing
        .iter()
        .copied()
        .filter(|d| archive.contains(d))
        .collect();

    Ok(GapReport {
        kind,
        store_range: (store_min, store_max),
        store_dates: store.len(),
        archive_range: Some((archive_min, archive_max)),
        missing,
        ranges,
        recoverable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, n).unwrap()
    }

    fn set(days: &[u32]) -> BTreeSet<NaiveDate> {
        days.iter().map(|&n| day(n)).collect()
    }

    #[test]
    fn singleton_gaps_are_not_merged() {
        let missing = missing_dates(&set(&[1, 2, 4, 5, 7]));
        assert_eq!(missing, vec![day(3), day(6)]);
        let ranges = coalesce(&missing);
        assert_eq!(
            ranges,
            vec![
                DateRange { start: day(3), end: day(3) },
                DateRange { start: day(6), end: day(6) },
            ]
        );
    }

    #[test]
    fn consecutive_gaps_form_one_range() {
        let ranges = coalesce(&missing_dates(&set(&[1, 5, 6, 9])));
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], DateRange { start: day(2), end: day(4) });
        assert_eq!(ranges[0].days(), 3);
        assert_eq!(ranges[0].to_string(), "2024-01-02..2024-01-04");
        assert_eq!(ranges[1].dates().collect::<Vec<_>>(), vec![day(7), day(8)]);
    }

    #[test]
    fn archive_dates_past_store_max_are_not_gaps() {
        let report = detect(Kind::Activation, &set(&[1, 3]), &set(&[1, 2, 3, 10, 11])).unwrap();
        assert_eq!(report.missing, vec![day(2)]);
        assert_eq!(report.recoverable, vec![day(2)]);
    }

    #[test]
    fn gaps_without_archive_rows_are_not_recoverable() {
        let report = detect(Kind::Renewal, &set(&[1, 4]), &set(&[1, 3, 4])).unwrap();
        assert_eq!(report.missing, vec![day(2), day(3)]);
        assert_eq!(report.recoverable, vec![day(3)]);
    }

    #[test]
    fn empty_inputs_skip_the_kind() {
        assert_eq!(
            detect(Kind::Refund, &BTreeSet::new(), &set(&[1])),
            Err(GapSkip::EmptyStore)
        );
        assert_eq!(
            detect(Kind::Refund, &set(&[1]), &BTreeSet::new()),
            Err(GapSkip::EmptyArchive)
        );
    }

    #[test]
    fn gap_spanning_month_boundary_stays_one_range() {
        let store: BTreeSet<NaiveDate> = [
            NaiveDate::from_ymd_opt(2024, 1, 30).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(),
        ]
        .into();
        let ranges = coalesce(&missing_dates(&store));
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].days(), 2);
    }
}

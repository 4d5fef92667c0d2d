//! Partition keys and read filters.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Serialize, Serializer};

use crate::record::TransactionRecord;

/// Directory name prefix for month partitions (`year_month=YYYY-MM`).
pub const PARTITION_PREFIX: &str = "year_month=";

/// A calendar month; the partition key of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    #[must_use]
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    #[must_use]
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    #[must_use]
    pub const fn year(self) -> i32 {
        self.year
    }

    #[must_use]
    pub const fn month(self) -> u32 {
        self.month
    }

    /// First day of the month.
    #[must_use]
    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Last day of the month.
    #[must_use]
    pub fn last_day(self) -> NaiveDate {
        self.first_day()
            .checked_add_months(Months::new(1))
            .and_then(|d| d.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    /// Directory name for this partition.
    #[must_use]
    pub fn dir_name(self) -> String {
        format!("{PARTITION_PREFIX}{self}")
    }

    /// Parse a `year_month=YYYY-MM` directory name.
    #[must_use]
    pub fn from_dir_name(name: &str) -> Option<Self> {
        name.strip_prefix(PARTITION_PREFIX)?.parse().ok()
    }

    /// Every month overlapping `[start, end]`.
    #[must_use]
    pub fn span(start: NaiveDate, end: NaiveDate) -> BTreeSet<Self> {
        let mut months = BTreeSet::new();
        let last = Self::of(end);
        let mut cur = Self::of(start);
        while cur <= last {
            months.insert(cur);
            let Some(next) = cur.first_day().checked_add_months(Months::new(1)) else {
                break;
            };
            cur = Self::of(next);
        }
        months
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid year-month '{s}'"))?;
        let year: i32 = y.parse().map_err(|_| format!("invalid year in '{s}'"))?;
        let month: u32 = m.parse().map_err(|_| format!("invalid month in '{s}'"))?;
        Self::new(year, month).ok_or_else(|| format!("invalid year-month '{s}'"))
    }
}

/// A record together with the partition it was read from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionedRecord {
    pub year_month: YearMonth,
    pub record: TransactionRecord,
}

/// Predicate for [`super::PartitionStore::read`]. Month constraints prune
/// partitions before any file is opened; date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadFilter {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub months: Option<BTreeSet<YearMonth>>,
}

impl ReadFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn date(date: NaiveDate) -> Self {
        Self::range(date, date)
    }

    #[must_use]
    pub fn range(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            months: None,
        }
    }

    #[must_use]
    pub fn months(months: BTreeSet<YearMonth>) -> Self {
        Self {
            start: None,
            end: None,
            months: Some(months),
        }
    }

    /// Whether any record of `month` can pass this filter.
    #[must_use]
    pub fn admits_month(&self, month: YearMonth) -> bool {
        if let Some(months) = &self.months
            && !months.contains(&month)
        {
            return false;
        }
        if let Some(start) = self.start
            && month.last_day() < start
        {
            return false;
        }
        if let Some(end) = self.end
            && month.first_day() > end
        {
            return false;
        }
        true
    }

    #[must_use]
    pub fn admits_date(&self, date: NaiveDate) -> bool {
        self.start.is_none_or(|s| date >= s)
            && self.end.is_none_or(|e| date <= e)
            && self
                .months
                .as_ref()
                .is_none_or(|m| m.contains(&YearMonth::of(date)))
    }
}

//! Period calculation.
//!
//! Every ledger-entry date belongs to exactly one weekly period (ISO week,
//! Monday start) and exactly one monthly period (calendar month). Periods
//! are half-open `[start, end)` date intervals. All functions here are pure;
//! any valid date maps to a deterministic period.

use std::collections::BTreeSet;

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Weekly,
    Monthly,
}

impl PeriodType {
    pub const ALL: [PeriodType; 2] = [PeriodType::Weekly, PeriodType::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "weekly" => Some(PeriodType::Weekly),
            "monthly" => Some(PeriodType::Monthly),
            _ => None,
        }
    }
}

impl std::fmt::Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A half-open aggregation interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub period_type: PeriodType,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn weekly(date: NaiveDate) -> Self {
        let start = date - Days::new(u64::from(date.weekday().num_days_from_monday()));
        Period {
            period_type: PeriodType::Weekly,
            start,
            end: start + Days::new(7),
        }
    }

    pub fn monthly(date: NaiveDate) -> Self {
        let start = date.with_day(1).expect("day 1 exists in every month");
        Period {
            period_type: PeriodType::Monthly,
            start,
            end: next_month_start(start),
        }
    }

    pub fn covering(period_type: PeriodType, date: NaiveDate) -> Self {
        match period_type {
            PeriodType::Weekly => Period::weekly(date),
            PeriodType::Monthly => Period::monthly(date),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.period_type, self.start)
    }
}

fn next_month_start(start: NaiveDate) -> NaiveDate {
    let (year, month) = if start.month() == 12 {
        (start.year() + 1, 1)
    } else {
        (start.year(), start.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("first of month is always valid")
}

/// Both persisted periods containing `date`.
pub fn periods_covering(date: NaiveDate) -> [Period; 2] {
    [Period::weekly(date), Period::monthly(date)]
}

/// Union of periods for a set of dates. Runs in O(unique dates): bulk
/// callers hand over many dates that collapse to few periods, and the
/// period math is only done once per distinct date.
pub fn distinct_periods<I>(dates: I) -> BTreeSet<Period>
where
    I: IntoIterator<Item = NaiveDate>,
{
    let unique: BTreeSet<NaiveDate> = dates.into_iter().collect();
    let mut periods = BTreeSet::new();
    for date in unique {
        for period in periods_covering(date) {
            periods.insert(period);
        }
    }
    periods
}

/// Every weekly and monthly period intersecting the inclusive date range
/// `[start, end]`. O(number of periods), independent of the range's entry
/// count.
pub fn periods_in_range(start: NaiveDate, end: NaiveDate) -> BTreeSet<Period> {
    let mut periods = BTreeSet::new();
    if start > end {
        return periods;
    }

    let mut week = Period::weekly(start);
    while week.start <= end {
        periods.insert(week);
        week = Period::weekly(week.end);
    }

    let mut month = Period::monthly(start);
    while month.start <= end {
        periods.insert(month);
        month = Period::monthly(month.end);
    }

    periods
}

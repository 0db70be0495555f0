//! Splitting of date ranges into upstream-sized request windows.
//!
//! Batch boundaries belong to the upstream API, so the policy comes from the
//! job configuration rather than from the fetcher.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::models::DateRange;

/// How a job's date range is cut into upstream requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchPolicy {
    /// One request for the whole range
    Whole,
    /// Windows of at most `days` calendar days
    FixedDays { days: u32 },
    /// Windows ending on Fridays, clipped to the requested range
    TradingWeeks,
    /// Calendar months, clipped to the requested range
    Monthly,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        BatchPolicy::Whole
    }
}

/// One date window of a batch plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateBatch {
    pub batch_number: usize,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub description: String,
}

impl DateBatch {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }
}

impl BatchPolicy {
    pub fn split(&self, range: &DateRange) -> Vec<DateBatch> {
        if range.start_date > range.end_date {
            return Vec::new();
        }

        let windows = match self {
            BatchPolicy::Whole => vec![(range.start_date, range.end_date)],
            BatchPolicy::FixedDays { days } => fixed_windows(range, (*days).max(1)),
            BatchPolicy::TradingWeeks => TradingWeekBatchCalculator::windows(range),
            BatchPolicy::Monthly => monthly_windows(range),
        };

        let label = match self {
            BatchPolicy::TradingWeeks => "Week",
            BatchPolicy::Monthly => "Month",
            _ => "Batch",
        };

        windows
            .into_iter()
            .enumerate()
            .map(|(i, (start_date, end_date))| DateBatch {
                batch_number: i + 1,
                start_date,
                end_date,
                description: format!(
                    "{} {}: {} to {}",
                    label,
                    i + 1,
                    start_date.format("%Y-%m-%d"),
                    end_date.format("%Y-%m-%d")
                ),
            })
            .collect()
    }
}

fn fixed_windows(range: &DateRange, days: u32) -> Vec<(NaiveDate, NaiveDate)> {
    let mut windows = Vec::new();
    let step = Duration::days(i64::from(days));
    let mut start = range.start_date;

    while start <= range.end_date {
        let end = std::cmp::min(start + step - Duration::days(1), range.end_date);
        windows.push((start, end));
        start = end + Duration::days(1);
    }

    windows
}

fn monthly_windows(range: &DateRange) -> Vec<(NaiveDate, NaiveDate)> {
    let mut windows = Vec::new();
    let mut start = range.start_date;

    while start <= range.end_date {
        let month_end = last_day_of_month(start);
        let end = std::cmp::min(month_end, range.end_date);
        windows.push((start, end));
        start = end + Duration::days(1);
    }

    windows
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(|first_of_next| first_of_next - Duration::days(1))
        .unwrap_or(date)
}

/// Trading week window calculator
pub struct TradingWeekBatchCalculator;

impl TradingWeekBatchCalculator {
    fn windows(range: &DateRange) -> Vec<(NaiveDate, NaiveDate)> {
        let mut windows = Vec::new();

        // Start with the trading week that contains the start date
        let mut current_week_start = Self::get_week_start(range.start_date);

        while current_week_start <= range.end_date {
            let current_week_end = Self::get_week_end(current_week_start);

            let batch_start = std::cmp::max(current_week_start, range.start_date);
            let batch_end = std::cmp::min(current_week_end, range.end_date);

            if batch_start <= batch_end {
                windows.push((batch_start, batch_end));
            }

            current_week_start = current_week_end + Duration::days(1);
        }

        windows
    }

    /// Monday of the week containing `date`
    pub fn get_week_start(date: NaiveDate) -> NaiveDate {
        date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
    }

    /// Next Friday on or after `date`
    pub fn get_week_end(date: NaiveDate) -> NaiveDate {
        let days_to_friday = match date.weekday() {
            Weekday::Sat => 6,
            Weekday::Sun => 5,
            other => 4 - other.num_days_from_monday(),
        };
        date + Duration::days(i64::from(days_to_friday))
    }
}

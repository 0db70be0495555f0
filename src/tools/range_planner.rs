use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::JobError;
use crate::models::{DateRange, UpdateMode};

/// Result of range planning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlannedRange {
    Range(DateRange),
    /// Nothing to fetch; callers report success with zero rows
    NoOp,
}

impl PlannedRange {
    pub fn is_noop(&self) -> bool {
        matches!(self, PlannedRange::NoOp)
    }

    pub fn range(&self) -> Option<DateRange> {
        match self {
            PlannedRange::Range(range) => Some(*range),
            PlannedRange::NoOp => None,
        }
    }

    fn from_bounds(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        if start_date > end_date {
            PlannedRange::NoOp
        } else {
            PlannedRange::Range(DateRange { start_date, end_date })
        }
    }
}

/// Inputs for one planning decision
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub entity_type: &'a str,
    pub mode: UpdateMode,
    pub watermark: Option<NaiveDate>,
    pub lookback_days: u32,
    pub today: NaiveDate,
    pub manual_range: Option<DateRange>,
}

/// Computes the date range a job should fetch next
#[derive(Debug, Clone)]
pub struct RangePlanner {
    default_epoch: NaiveDate,
    epochs: HashMap<String, NaiveDate>,
}

impl RangePlanner {
    pub fn new(default_epoch: NaiveDate) -> Self {
        Self {
            default_epoch,
            epochs: HashMap::new(),
        }
    }

    pub fn with_epoch(mut self, entity_type: impl Into<String>, epoch: NaiveDate) -> Self {
        self.epochs.insert(entity_type.into(), epoch);
        self
    }

    /// Earliest date data can exist for an entity type
    pub fn epoch_start(&self, entity_type: &str) -> NaiveDate {
        self.epochs
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_epoch)
    }

    pub fn plan(&self, request: &PlanRequest<'_>) -> Result<PlannedRange, JobError> {
        let epoch = self.epoch_start(request.entity_type);

        let planned = match request.mode {
            UpdateMode::Full => PlannedRange::from_bounds(epoch, request.today),
            UpdateMode::Incremental => match request.watermark {
                None => PlannedRange::from_bounds(epoch, request.today),
                Some(watermark) => {
                    let start = watermark - Duration::days(i64::from(request.lookback_days));
                    // A lookback that crosses the epoch never asks for pre-epoch data
                    PlannedRange::from_bounds(start.max(epoch), request.today)
                }
            },
            UpdateMode::Manual => {
                let range = request.manual_range.ok_or_else(|| {
                    JobError::Config("manual mode requires both a start and an end date".into())
                })?;
                PlannedRange::from_bounds(range.start_date, range.end_date)
            }
        };

        debug!(
            "📅 Planned {:?} for {} (watermark {:?}): {:?}",
            request.mode, request.entity_type, request.watermark, planned
        );
        Ok(planned)
    }
}

impl Default for RangePlanner {
    fn default() -> Self {
        Self::new(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN))
    }
}

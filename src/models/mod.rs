use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ErrorKind, JobError};

/// Inclusive date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl DateRange {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self { start_date, end_date }
    }

    pub fn days_count(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start_date && date <= self.end_date
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start_date, self.end_date)
    }
}

/// How a job decides which dates to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Everything from the entity type's epoch up to today
    Full,
    /// From the persisted watermark (minus lookback) up to today
    Incremental,
    /// Caller-supplied start and end dates
    Manual,
}

/// Entities a job covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityKeys {
    All(AllEntities),
    List(Vec<String>),
}

/// Marker that deserializes only from the string `"all"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllEntities {
    All,
}

impl EntityKeys {
    pub fn all() -> Self {
        EntityKeys::All(AllEntities::All)
    }

    pub fn list<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EntityKeys::List(keys.into_iter().map(Into::into).collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, EntityKeys::All(_))
    }
}

impl Default for EntityKeys {
    fn default() -> Self {
        EntityKeys::all()
    }
}

/// Identifies a unit of work. Immutable once scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub entity_keys: EntityKeys,
    pub source_name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_keys: EntityKeys::all(),
            source_name: source_name.into(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_entities(mut self, entity_keys: EntityKeys) -> Self {
        self.entity_keys = entity_keys;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

/// Lifecycle status of a job within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Skipped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Outcome of one job within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_name: String,
    pub status: JobStatus,
    pub rows_processed: u64,
    pub attempts: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionResult {
    pub fn pending(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            status: JobStatus::Pending,
            rows_processed: 0,
            attempts: 0,
            start_time: None,
            end_time: None,
            error_message: None,
            error_kind: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Result for a job that never ran because of `reason`.
    pub fn skipped(job_name: impl Into<String>, reason: &JobError) -> Self {
        let now = Utc::now();
        let mut result = Self::pending(job_name);
        result.status = JobStatus::Skipped;
        result.start_time = Some(now);
        result.end_time = Some(now);
        result.error_message = Some(reason.to_string());
        result.error_kind = Some(reason.kind());
        result
    }

    pub fn mark_running(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Running;
        self.start_time.get_or_insert_with(Utc::now);
    }

    /// Back to pending while waiting out a retry backoff
    pub fn mark_pending(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Pending;
    }

    pub fn mark_success(&mut self, rows_processed: u64) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Success;
        self.rows_processed = rows_processed;
        self.end_time = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &JobError) {
        self.finish_with_error(JobStatus::Failed, error);
    }

    pub fn mark_skipped(&mut self, reason: &JobError) {
        self.finish_with_error(JobStatus::Skipped, reason);
    }

    fn finish_with_error(&mut self, status: JobStatus, error: &JobError) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.rows_processed = 0;
        self.error_message = Some(error.to_string());
        self.error_kind = Some(error.kind());
        self.end_time = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        }
    }
}

/// A record as delivered by one upstream source, before reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub entity: String,
    pub period_end: NaiveDate,
    pub announce_date: NaiveDate,
    pub source: String,
    pub fields: BTreeMap<String, Option<f64>>,
}

impl RawRecord {
    pub fn new(
        entity: impl Into<String>,
        period_end: NaiveDate,
        announce_date: NaiveDate,
        source: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            period_end,
            announce_date,
            source: source.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Option<f64>) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Deterministic ordering used when merging batches.
    pub fn sort_key(&self) -> (&str, NaiveDate, NaiveDate, &str) {
        (&self.entity, self.period_end, self.announce_date, &self.source)
    }
}

/// Completeness of a reconciled record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    /// Every field of the domain is present
    Complete,
    /// Some domain fields are null
    Partial,
    /// Source is not ranked in the domain's priority order
    Unranked,
}

/// The reconciled, point-in-time fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitRecord {
    pub entity: String,
    pub period_end: NaiveDate,
    pub announce_date: NaiveDate,
    pub source: String,
    pub fields: BTreeMap<String, Option<f64>>,
    pub data_quality: DataQuality,
    pub is_authoritative: bool,
    /// Storage revision of the natural key; bumps when authority is re-decided.
    pub revision: u32,
}

/// Natural key of a [`PitRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PitKey {
    pub entity: String,
    pub period_end: NaiveDate,
    pub announce_date: NaiveDate,
    pub source: String,
}

impl PitRecord {
    pub fn key(&self) -> PitKey {
        PitKey {
            entity: self.entity.clone(),
            period_end: self.period_end,
            announce_date: self.announce_date,
            source: self.source.clone(),
        }
    }

    /// Same fact content, ignoring the storage revision.
    pub fn same_content(&self, other: &PitRecord) -> bool {
        self.key() == other.key()
            && self.fields == other.fields
            && self.data_quality == other.data_quality
            && self.is_authoritative == other.is_authoritative
    }
}

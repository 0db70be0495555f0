//! Units of work scheduled by the orchestrator.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;
use crate::models::{DateRange, JobSpec, UpdateMode};

pub mod builder;
pub mod sync_job;

pub use builder::build_registry;
pub use sync_job::{PassthroughTransform, PitTransform, RowTransform, SyncJob, TransformOutput};

/// Per-attempt view of the run a job executes in
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: Uuid,
    pub mode: UpdateMode,
    pub today: NaiveDate,
    pub manual_range: Option<DateRange>,
    /// 1-based attempt number
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(mode: UpdateMode, today: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            today,
            manual_range: None,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_manual_range(mut self, range: DateRange) -> Self {
        self.manual_range = Some(range);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What a successful attempt reports back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub rows_processed: u64,
    pub metadata: BTreeMap<String, String>,
}

impl JobOutput {
    pub fn rows(rows_processed: u64) -> Self {
        Self {
            rows_processed,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn spec(&self) -> &JobSpec;

    /// One attempt. Must be safe to call again after a retryable failure.
    async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError>;

    fn name(&self) -> &str {
        &self.spec().name
    }
}

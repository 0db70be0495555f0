use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::api::{BatchParams, RequestPacer, UpstreamSource};
use crate::error::{JobError, UpstreamError};
use crate::models::{DateRange, RawRecord};
use crate::tools::batching::{BatchPolicy, DateBatch};
use crate::validation::RowValidator;

/// One upstream request that failed
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub batch: DateBatch,
    pub entities: Vec<String>,
    pub error: UpstreamError,
}

/// Everything a fetch produced, including the batches that failed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// Sorted by entity, period end, announce date, source
    pub rows: Vec<RawRecord>,
    pub rejected: usize,
    pub batches_total: usize,
    pub failures: Vec<BatchFailure>,
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Some batches succeeded and some failed
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty() && self.failures.len() < self.batches_total
    }

    /// Error to report for the whole fetch. A fatal failure wins over a
    /// retryable one so a bad credential is not retried because a sibling
    /// batch hit a timeout.
    pub fn error(&self) -> Option<JobError> {
        let fatal = self
            .failures
            .iter()
            .map(|f| JobError::from(f.error.clone()))
            .find(|e| !e.is_retryable());
        fatal.or_else(|| self.failures.first().map(|f| JobError::from(f.error.clone())))
    }
}

/// Maps a date range and entity list onto upstream batch requests
pub struct BatchFetchJob {
    source: Arc<dyn UpstreamSource>,
    api_name: String,
    policy: BatchPolicy,
    entity_chunk: usize,
    max_in_flight: usize,
    validator: RowValidator,
    pacer: Option<Arc<RequestPacer>>,
}

impl BatchFetchJob {
    pub fn new(source: Arc<dyn UpstreamSource>, api_name: impl Into<String>) -> Self {
        Self {
            source,
            api_name: api_name.into(),
            policy: BatchPolicy::Whole,
            entity_chunk: 0,
            max_in_flight: 4,
            validator: RowValidator::default(),
            pacer: None,
        }
    }

    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Entities per request; 0 sends the whole list in one request
    pub fn with_entity_chunk(mut self, entity_chunk: usize) -> Self {
        self.entity_chunk = entity_chunk;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_validator(mut self, validator: RowValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_pacer(mut self, pacer: Option<RequestPacer>) -> Self {
        self.pacer = pacer.map(Arc::new);
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    /// Request plan: every date window crossed with every entity chunk
    pub fn plan(&self, range: &DateRange, entities: &[String]) -> Vec<(DateBatch, Vec<String>)> {
        let chunks: Vec<Vec<String>> = if entities.is_empty() || self.entity_chunk == 0 {
            vec![entities.to_vec()]
        } else {
            entities
                .chunks(self.entity_chunk)
                .map(<[String]>::to_vec)
                .collect()
        };

        self.policy
            .split(range)
            .into_iter()
            .flat_map(|batch| chunks.iter().map(move |chunk| (batch.clone(), chunk.clone())))
            .collect()
    }

    /// Fetch every batch. A failing batch never aborts its siblings.
    pub async fn run(&self, range: &DateRange, entities: &[String]) -> FetchOutcome {
        let plan = self.plan(range, entities);
        let batches_total = plan.len();
        info!(
            "🚀 Fetching {}:{} for {} in {} batches",
            self.source.name(),
            self.api_name,
            range,
            batches_total
        );

        let mut results = stream::iter(plan.into_iter().enumerate())
            .map(|(index, (batch, chunk))| async move {
                if let Some(pacer) = &self.pacer {
                    pacer.wait().await;
                }
                let params = BatchParams {
                    entities: chunk.clone(),
                    start_date: batch.start_date,
                    end_date: batch.end_date,
                    batch_number: index + 1,
                };
                let result = self.source.fetch_batch(&self.api_name, &params).await;
                (batch, chunk, result)
            })
            .buffer_unordered(self.max_in_flight);

        let mut outcome = FetchOutcome {
            batches_total,
            ..FetchOutcome::default()
        };
        let mut fetched = Vec::new();

        while let Some((batch, chunk, result)) = results.next().await {
            match result {
                Ok(records) => {
                    debug!("✅ {} - {} records", batch.description, records.len());
                    fetched.extend(records);
                }
                Err(e) => {
                    error!("❌ {} failed - {}", batch.description, e);
                    outcome.failures.push(BatchFailure {
                        batch,
                        entities: chunk,
                        error: e,
                    });
                }
            }
        }

        // Completion order is arbitrary; merge deterministically
        fetched.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        outcome
            .failures
            .sort_by(|a, b| a.batch.batch_number.cmp(&b.batch.batch_number));

        let validated = self.validator.validate(fetched);
        outcome.rows = validated.rows;
        outcome.rejected = validated.rejected;

        info!(
            "📊 {}:{} fetched {} rows ({} rejected, {}/{} batches failed)",
            self.source.name(),
            self.api_name,
            outcome.rows.len(),
            outcome.rejected,
            outcome.failures.len(),
            batches_total
        );
        outcome
    }
}

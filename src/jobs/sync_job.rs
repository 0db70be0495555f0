use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Job, JobContext, JobOutput};
use crate::batch_fetcher::{BatchFetchJob, FetchOutcome};
use crate::database::{PersistenceGateway, Row};
use crate::error::JobError;
use crate::models::{DateRange, EntityKeys, JobSpec, PitRecord, RawRecord};
use crate::reconcile::ledger::{self, PitLedger};
use crate::reconcile::PitReconciler;
use crate::tools::range_planner::{PlanRequest, PlannedRange, RangePlanner};

/// Rows ready to persist
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    pub rows: Vec<Row>,
    pub warnings: Vec<String>,
}

/// Turns validated upstream records into table rows
pub trait RowTransform: Send + Sync {
    fn name(&self) -> &str;

    fn primary_key(&self) -> Vec<String>;

    fn transform(&self, records: Vec<RawRecord>) -> Result<TransformOutput, JobError>;

    /// Called when the rows of a successful `transform` were not persisted,
    /// including when the attempt was dropped mid-write
    fn rollback(&self, _rows: &[Row]) {}

    /// Lock held from `transform` until its rows are persisted or rolled back
    fn write_gate(&self) -> Option<Arc<tokio::sync::Mutex<()>>> {
        None
    }
}

/// Rows produced by a transform and not yet confirmed written
struct PendingRows<'a> {
    transform: &'a dyn RowTransform,
    rows: &'a [Row],
    persisted: bool,
}

impl Drop for PendingRows<'_> {
    fn drop(&mut self) {
        if !self.persisted && !self.rows.is_empty() {
            debug!(
                "↩️ Rolling back {} unpersisted rows of the {} transform",
                self.rows.len(),
                self.transform.name()
            );
            self.transform.rollback(self.rows);
        }
    }
}

/// Single-source tables: one row per `(entity, period_end, source)`
#[derive(Debug, Clone, Default)]
pub struct PassthroughTransform;

impl RowTransform for PassthroughTransform {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn primary_key(&self) -> Vec<String> {
        vec!["entity".into(), "date".into(), "source".into()]
    }

    fn transform(&self, records: Vec<RawRecord>) -> Result<TransformOutput, JobError> {
        let rows = records
            .into_iter()
            .map(|record| {
                let mut row = Row::new(record.entity, record.period_end)
                    .with_value("source", record.source)
                    .with_value(
                        "announce_date",
                        record.announce_date.format("%Y-%m-%d").to_string(),
                    );
                for (name, value) in record.fields {
                    row = row.with_value(name, value.map(serde_json::Value::from).unwrap_or_default());
                }
                row
            })
            .collect();

        Ok(TransformOutput {
            rows,
            warnings: Vec::new(),
        })
    }
}

/// Multi-source PIT tables: reconcile, then append ledger revisions
pub struct PitTransform {
    reconciler: Arc<PitReconciler>,
    ledger: Arc<PitLedger>,
}

impl PitTransform {
    pub fn new(reconciler: Arc<PitReconciler>, ledger: Arc<PitLedger>) -> Self {
        Self { reconciler, ledger }
    }
}

impl RowTransform for PitTransform {
    fn name(&self) -> &str {
        "pit"
    }

    fn primary_key(&self) -> Vec<String> {
        ledger::pit_primary_key()
    }

    fn transform(&self, records: Vec<RawRecord>) -> Result<TransformOutput, JobError> {
        let mut by_source: BTreeMap<String, Vec<RawRecord>> = BTreeMap::new();
        for record in records {
            by_source.entry(record.source.clone()).or_default().push(record);
        }

        let reconciliation = self.reconciler.reconcile(&by_source);
        let appended = self.ledger.merge(&self.reconciler, reconciliation.records);

        let rows = appended
            .iter()
            .map(ledger::to_row)
            .collect::<Result<Vec<_>, _>>();
        match rows {
            Ok(rows) => Ok(TransformOutput {
                rows,
                warnings: reconciliation.warnings,
            }),
            Err(e) => {
                self.ledger.forget(&appended);
                Err(JobError::Internal(format!("cannot encode PIT rows: {}", e)))
            }
        }
    }

    fn rollback(&self, rows: &[Row]) {
        let appended: Vec<PitRecord> = rows.iter().filter_map(|r| ledger::from_row(r).ok()).collect();
        self.ledger.forget(&appended);
    }

    fn write_gate(&self) -> Option<Arc<tokio::sync::Mutex<()>>> {
        Some(self.ledger.write_gate())
    }
}

/// Generic fetch → transform → persist job
pub struct SyncJob {
    spec: JobSpec,
    table: String,
    entity_type: String,
    planner: Arc<RangePlanner>,
    lookback_days: u32,
    fetcher: BatchFetchJob,
    transform: Arc<dyn RowTransform>,
    gateway: Arc<dyn PersistenceGateway>,
    best_effort: bool,
}

impl SyncJob {
    pub fn new(
        spec: JobSpec,
        table: impl Into<String>,
        fetcher: BatchFetchJob,
        transform: Arc<dyn RowTransform>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let table = table.into();
        Self {
            spec,
            entity_type: table.clone(),
            table,
            planner: Arc::new(RangePlanner::default()),
            lookback_days: 0,
            fetcher,
            transform,
            gateway,
            best_effort: false,
        }
    }

    pub fn with_planner(mut self, planner: Arc<RangePlanner>, entity_type: impl Into<String>) -> Self {
        self.planner = planner;
        self.entity_type = entity_type.into();
        self
    }

    pub fn with_lookback_days(mut self, lookback_days: u32) -> Self {
        self.lookback_days = lookback_days;
        self
    }

    /// Report partial fetches as success instead of failing the job
    pub fn best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn plan_request(&self, ctx: &JobContext, watermark: Option<NaiveDate>) -> PlanRequest<'_> {
        PlanRequest {
            entity_type: &self.entity_type,
            mode: ctx.mode,
            watermark,
            lookback_days: self.lookback_days,
            today: ctx.today,
            manual_range: ctx.manual_range,
        }
    }

    /// Entities grouped by the range they need. An empty entity list means
    /// the whole table. Watermarks are read for this job's source only, so
    /// sources sharing a table never shorten each other's ranges.
    async fn plan(&self, ctx: &JobContext) -> Result<BTreeMap<(NaiveDate, NaiveDate), Vec<String>>, JobError> {
        let mut groups: BTreeMap<(NaiveDate, NaiveDate), Vec<String>> = BTreeMap::new();

        match &self.spec.entity_keys {
            EntityKeys::All(_) => {
                let watermark = self
                    .gateway
                    .source_watermark(&self.table, &self.spec.source_name, None)
                    .await?;
                if let PlannedRange::Range(range) = self.planner.plan(&self.plan_request(ctx, watermark))? {
                    groups.insert((range.start_date, range.end_date), Vec::new());
                }
            }
            EntityKeys::List(entities) => {
                for entity in entities {
                    let watermark = self
                        .gateway
                        .source_watermark(&self.table, &self.spec.source_name, Some(entity.as_str()))
                        .await?;
                    match self.planner.plan(&self.plan_request(ctx, watermark))? {
                        PlannedRange::Range(range) => groups
                            .entry((range.start_date, range.end_date))
                            .or_default()
                            .push(entity.clone()),
                        PlannedRange::NoOp => debug!("⚪ {} {} is up to date", self.spec.name, entity),
                    }
                }
            }
        }

        Ok(groups)
    }
}

/// Entities that appear in no failed batch. `None` when a failed batch
/// covered every entity.
fn clean_entities(outcome: &FetchOutcome) -> Option<BTreeSet<String>> {
    let mut failed = BTreeSet::new();
    for failure in &outcome.failures {
        if failure.entities.is_empty() {
            return None;
        }
        failed.extend(failure.entities.iter().cloned());
    }
    Some(
        outcome
            .rows
            .iter()
            .map(|r| r.entity.clone())
            .filter(|e| !failed.contains(e))
            .collect(),
    )
}

#[async_trait]
impl Job for SyncJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let groups = self.plan(ctx).await?;
        if groups.is_empty() {
            info!("⚪ {} has nothing to fetch", self.spec.name);
            return Ok(JobOutput::rows(0).with_metadata("noop", true));
        }

        let mut fetched = Vec::new();
        let mut rejected = 0;
        let mut batches = 0;
        let mut failed_batches = 0;
        let mut first_error: Option<JobError> = None;

        for ((start_date, end_date), entities) in &groups {
            let range = DateRange::new(*start_date, *end_date);
            let outcome = self.fetcher.run(&range, entities).await;

            batches += outcome.batches_total;
            failed_batches += outcome.failures.len();
            rejected += outcome.rejected;

            match outcome.error() {
                None => fetched.extend(outcome.rows),
                Some(error) => {
                    // Keep the most severe error across groups
                    let replace = match &first_error {
                        None => true,
                        Some(existing) => existing.is_retryable() && !error.is_retryable(),
                    };
                    if replace {
                        first_error = Some(error);
                    }
                    // Only entities whose every batch succeeded may move their watermark
                    if let Some(clean) = clean_entities(&outcome) {
                        fetched.extend(outcome.rows.into_iter().filter(|r| clean.contains(&r.entity)));
                    }
                }
            }
        }

        if let Some(error) = &first_error {
            if !self.best_effort || !error.is_retryable() {
                warn!("⚠️ {} failed {} of {} batches", self.spec.name, failed_batches, batches);
                return Err(error.clone());
            }
        }

        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let _gate = match self.transform.write_gate() {
            Some(gate) => Some(gate.lock_owned().await),
            None => None,
        };

        let fetched_count = fetched.len();
        let output = self.transform.transform(fetched)?;
        for warning in &output.warnings {
            warn!("⚠️ {}: {}", self.spec.name, warning);
        }

        let written = output.rows.len() as u64;
        let mut pending = PendingRows {
            transform: self.transform.as_ref(),
            rows: &output.rows,
            persisted: false,
        };
        let affected = self
            .gateway
            .upsert(&self.table, &output.rows, &self.transform.primary_key())
            .await?;
        pending.persisted = true;

        info!(
            "✅ {} wrote {} rows to {} ({} changed, {} rejected)",
            self.spec.name, written, self.table, affected, rejected
        );

        let mut result = JobOutput::rows(written)
            .with_metadata("rows_fetched", fetched_count)
            .with_metadata("rows_rejected", rejected)
            .with_metadata("rows_affected", affected)
            .with_metadata("batches", batches)
            .with_metadata("transform", self.transform.name());
        if !output.warnings.is_empty() {
            result = result.with_metadata("warnings", output.warnings.len());
        }
        if first_error.is_some() {
            result = result
                .with_metadata("partial", true)
                .with_metadata("failed_batches", failed_batches);
        }
        Ok(result)
    }
}

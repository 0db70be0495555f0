//! Bounded-concurrency scheduling of named jobs with dependency edges.

use chrono::{NaiveDate, Utc};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{JobError, OrchestratorError};
use crate::executor::RetryingExecutor;
use crate::jobs::{Job, JobContext};
use crate::models::{DateRange, ExecutionResult, JobStatus, UpdateMode};

pub mod registry;
pub mod report;

pub use registry::{topological_order, JobRegistry};
pub use report::{ExecutionSummary, JobIssue};

/// Run-wide inputs handed to every job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParameters {
    pub mode: UpdateMode,
    pub today: NaiveDate,
    pub manual_range: Option<DateRange>,
}

impl RunParameters {
    pub fn new(mode: UpdateMode, today: NaiveDate) -> Self {
        Self {
            mode,
            today,
            manual_range: None,
        }
    }

    pub fn with_manual_range(mut self, range: DateRange) -> Self {
        self.manual_range = Some(range);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    /// In dependency order
    pub results: Vec<ExecutionResult>,
    pub summary: ExecutionSummary,
}

impl RunOutcome {
    pub fn result(&self, job_name: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.job_name == job_name)
    }
}

pub struct TaskOrchestrator {
    executor: Arc<RetryingExecutor>,
    cancel: CancellationToken,
}

impl TaskOrchestrator {
    pub fn new(executor: RetryingExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling this token skips everything not yet finished
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `jobs` with at most `max_concurrency` executing at once.
    ///
    /// Job failures land in the results; only setup problems are errors.
    pub async fn run_all(
        &self,
        jobs: Vec<Arc<dyn Job>>,
        max_concurrency: usize,
        params: RunParameters,
    ) -> Result<RunOutcome, OrchestratorError> {
        if max_concurrency == 0 {
            return Err(OrchestratorError::InvalidConcurrency);
        }
        let order = topological_order(&jobs)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            "🚀 Starting run {} with {} jobs (max concurrency {}, mode {:?})",
            run_id,
            jobs.len(),
            max_concurrency,
            params.mode
        );

        let by_name: HashMap<String, Arc<dyn Job>> = jobs
            .into_iter()
            .map(|job| (job.name().to_string(), job))
            .collect();
        let mut results: BTreeMap<String, ExecutionResult> = order
            .iter()
            .map(|name| (name.clone(), ExecutionResult::pending(name)))
            .collect();

        let limiter = Arc::new(Semaphore::new(max_concurrency));
        let mut waiting: Vec<String> = order.clone();
        let mut in_flight: JoinSet<Result<(String, ExecutionResult), OrchestratorError>> = JoinSet::new();

        loop {
            let mut still_waiting = Vec::with_capacity(waiting.len());
            for name in waiting {
                let Some(job) = by_name.get(&name) else {
                    continue;
                };

                if self.cancel.is_cancelled() {
                    mark_skipped(&mut results, &name, &JobError::Cancelled);
                    continue;
                }

                match dependency_state(job.as_ref(), &results) {
                    DependencyState::Blocked(dependency) => {
                        warn!("⏭️  Skipping {}: dependency {} did not succeed", name, dependency);
                        mark_skipped(&mut results, &name, &JobError::DependencyFailed(dependency));
                    }
                    DependencyState::Waiting => still_waiting.push(name),
                    DependencyState::Ready => {
                        if let Some(result) = results.get_mut(&name) {
                            result.mark_running();
                        }
                        let ctx = JobContext {
                            run_id,
                            mode: params.mode,
                            today: params.today,
                            manual_range: params.manual_range,
                            attempt: 1,
                            cancel: self.cancel.clone(),
                        };
                        in_flight.spawn(run_job(
                            Arc::clone(job),
                            Arc::clone(&self.executor),
                            Arc::clone(&limiter),
                            ctx,
                        ));
                    }
                }
            }
            waiting = still_waiting;

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok((name, result))) => {
                    results.insert(name, result);
                }
                Ok(Err(setup_error)) => {
                    in_flight.abort_all();
                    return Err(setup_error);
                }
                Err(join_error) => error!("❌ Job task ended abnormally: {}", join_error),
            }
        }

        // Anything left over never reached a terminal state
        for (name, result) in results.iter_mut() {
            if !result.status.is_terminal() {
                let reason = JobError::Internal(format!("{} never completed", name));
                result.mark_failed(&reason);
            }
        }

        let results: Vec<ExecutionResult> = order
            .iter()
            .filter_map(|name| results.remove(name))
            .collect();
        let summary = ExecutionSummary::from_results(run_id, started_at, Utc::now(), &results);

        info!(
            "🏁 Run {} finished: {} succeeded, {} failed, {} skipped, {} rows",
            run_id,
            summary.count(JobStatus::Success),
            summary.count(JobStatus::Failed),
            summary.count(JobStatus::Skipped),
            summary.total_rows
        );

        Ok(RunOutcome {
            run_id,
            results,
            summary,
        })
    }
}

enum DependencyState {
    Ready,
    Waiting,
    /// Names the first dependency that failed or was skipped
    Blocked(String),
}

fn dependency_state(job: &dyn Job, results: &BTreeMap<String, ExecutionResult>) -> DependencyState {
    let mut waiting = false;
    for dependency in &job.spec().dependencies {
        match results.get(dependency).map(|r| r.status) {
            Some(JobStatus::Success) => {}
            Some(JobStatus::Failed) | Some(JobStatus::Skipped) | None => {
                return DependencyState::Blocked(dependency.clone())
            }
            Some(JobStatus::Pending) | Some(JobStatus::Running) => waiting = true,
        }
    }
    if waiting {
        DependencyState::Waiting
    } else {
        DependencyState::Ready
    }
}

fn mark_skipped(results: &mut BTreeMap<String, ExecutionResult>, name: &str, reason: &JobError) {
    if let Some(result) = results.get_mut(name) {
        result.mark_skipped(reason);
    }
}

/// Wait for a slot, then execute. Panics become failed results.
async fn run_job(
    job: Arc<dyn Job>,
    executor: Arc<RetryingExecutor>,
    limiter: Arc<Semaphore>,
    ctx: JobContext,
) -> Result<(String, ExecutionResult), OrchestratorError> {
    let name = job.name().to_string();

    let _permit = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            return Ok((name.clone(), ExecutionResult::skipped(&name, &JobError::Cancelled)));
        }
        permit = limiter.acquire_owned() => permit.map_err(|_| OrchestratorError::LimiterClosed)?,
    };

    let execution = AssertUnwindSafe(executor.execute(job.as_ref(), &ctx)).catch_unwind().await;
    let result = match execution {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("💥 {} panicked: {}", name, message);
            let mut result = ExecutionResult::pending(&name);
            result.attempts = 1;
            result.mark_running();
            result.mark_failed(&JobError::Internal(format!("job panicked: {}", message)));
            result
        }
    };

    Ok((name, result))
}

//! Orchestrator scheduling tests

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use std::time::Duration;

use crate::common::fixtures::{date, ConcurrencyGauge, TestJob};
use pit_sync::error::{ErrorKind, JobError, OrchestratorError};
use pit_sync::executor::{RetryPolicy, RetryingExecutor};
use pit_sync::models::{JobStatus, UpdateMode};
use pit_sync::orchestrator::{RunParameters, TaskOrchestrator};

fn orchestrator() -> TaskOrchestrator {
    TaskOrchestrator::new(RetryingExecutor::new(RetryPolicy {
        max_retries: 1,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(2),
        rate_limit_multiplier: 1.0,
        timeout: Duration::from_secs(5),
        jitter: false,
    }))
}

fn params() -> RunParameters {
    RunParameters::new(UpdateMode::Incremental, date(2024, 1, 20))
}

#[test_log::test(tokio::test)]
async fn test_concurrency_bound_is_never_exceeded() {
    let gauge = ConcurrencyGauge::new();
    let jobs = (0..8)
        .map(|i| {
            TestJob::slow(&format!("job_{}", i), Duration::from_millis(30))
                .gauged(&gauge)
                .shared()
        })
        .collect();

    let outcome = orchestrator().run_all(jobs, 3, params()).await.unwrap();

    assert_eq!(gauge.started(), 8);
    assert!(gauge.peak() <= 3, "peak concurrency was {}", gauge.peak());
    assert!(gauge.peak() >= 2);
    assert_eq!(outcome.summary.count(JobStatus::Success), 8);
    assert_eq!(outcome.summary.exit_code(false), 0);
}

#[test_log::test(tokio::test)]
async fn test_sequential_mode_runs_one_at_a_time() {
    let gauge = ConcurrencyGauge::new();
    let jobs = (0..4)
        .map(|i| TestJob::slow(&format!("job_{}", i), Duration::from_millis(5)).gauged(&gauge).shared())
        .collect();

    orchestrator().run_all(jobs, 1, params()).await.unwrap();
    assert_eq!(gauge.peak(), 1);
}

#[test_log::test(tokio::test)]
async fn test_failures_and_panics_are_isolated() {
    let jobs = vec![
        TestJob::succeeding("prices", 10).shared(),
        TestJob::failing("quotes", JobError::Auth("expired token".into())).shared(),
        TestJob::panicking("ratios", "division by zero").shared(),
        TestJob::succeeding("income", 4).shared(),
    ];

    let outcome = orchestrator().run_all(jobs, 4, params()).await.unwrap();

    assert_eq!(outcome.result("prices").unwrap().status, JobStatus::Success);
    assert_eq!(outcome.result("income").unwrap().rows_processed, 4);

    let quotes = outcome.result("quotes").unwrap();
    assert_eq!(quotes.status, JobStatus::Failed);
    assert_eq!(quotes.attempts, 1);
    assert_eq!(quotes.error_kind, Some(ErrorKind::Auth));

    let ratios = outcome.result("ratios").unwrap();
    assert_eq!(ratios.status, JobStatus::Failed);
    assert!(ratios.error_message.as_deref().unwrap().contains("division by zero"));

    assert_eq!(outcome.summary.total_rows, 14);
    assert_eq!(outcome.summary.failed_jobs.len(), 2);
    assert_eq!(outcome.summary.exit_code(false), 1);
}

#[test_log::test(tokio::test)]
async fn test_dependents_of_a_failed_job_are_skipped() {
    let jobs = vec![
        TestJob::failing("prices", JobError::Transient("503".into())).shared(),
        TestJob::succeeding("ratios", 5).depends_on("prices").shared(),
        TestJob::succeeding("screens", 5).depends_on("ratios").shared(),
        TestJob::succeeding("income", 2).shared(),
    ];

    let outcome = orchestrator().run_all(jobs, 2, params()).await.unwrap();

    let prices = outcome.result("prices").unwrap();
    assert_eq!(prices.status, JobStatus::Failed);
    assert_eq!(prices.attempts, 2);

    for name in ["ratios", "screens"] {
        let result = outcome.result(name).unwrap();
        assert_eq!(result.status, JobStatus::Skipped);
        assert_eq!(result.rows_processed, 0);
        assert_eq!(result.error_kind, Some(ErrorKind::DependencyFailed));
    }
    assert_eq!(outcome.result("income").unwrap().status, JobStatus::Success);
    assert_eq!(outcome.summary.skipped_jobs.len(), 2);
    assert_ne!(outcome.summary.exit_code(false), 0);
}

#[test_log::test(tokio::test)]
async fn test_dependencies_finish_before_dependents_start() {
    let jobs = vec![
        TestJob::succeeding("screens", 1).depends_on("ratios").shared(),
        TestJob::slow("prices", Duration::from_millis(20)).shared(),
        TestJob::succeeding("ratios", 1).depends_on("prices").shared(),
    ];

    let outcome = orchestrator().run_all(jobs, 3, params()).await.unwrap();
    let names: Vec<&str> = outcome.results.iter().map(|r| r.job_name.as_str()).collect();
    assert_eq!(names, vec!["prices", "ratios", "screens"]);

    let prices_end = outcome.result("prices").unwrap().end_time.unwrap();
    let ratios_start = outcome.result("ratios").unwrap().start_time.unwrap();
    assert!(ratios_start >= prices_end);
}

#[test_log::test(tokio::test)]
async fn test_cancellation_skips_unfinished_jobs() {
    let orchestrator = orchestrator();
    let cancel = orchestrator.cancellation_token();
    let jobs = vec![
        TestJob::slow("slow_a", Duration::from_secs(30)).shared(),
        TestJob::slow("slow_b", Duration::from_secs(30)).shared(),
        TestJob::succeeding("after", 1).depends_on("slow_a").shared(),
    ];

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), orchestrator.run_all(jobs, 2, params()))
        .await
        .expect("cancelled run must finish promptly")
        .unwrap();

    for result in &outcome.results {
        assert_eq!(result.status, JobStatus::Skipped, "{} was {}", result.job_name, result.status);
    }
    assert_eq!(outcome.summary.exit_code(false), 0);
    assert_eq!(outcome.summary.exit_code(true), 1);
}

#[test_log::test(tokio::test)]
async fn test_setup_errors_escape_run_all() {
    let cyclic = vec![
        TestJob::succeeding("a", 1).depends_on("b").shared(),
        TestJob::succeeding("b", 1).depends_on("a").shared(),
    ];
    assert_matches!(
        orchestrator().run_all(cyclic, 2, params()).await,
        Err(OrchestratorError::DependencyCycle(_))
    );

    let dangling = vec![TestJob::succeeding("a", 1).depends_on("ghost").shared()];
    assert_matches!(
        orchestrator().run_all(dangling, 2, params()).await,
        Err(OrchestratorError::UnknownDependency { .. })
    );

    let fine = vec![TestJob::succeeding("a", 1).shared()];
    assert_matches!(
        orchestrator().run_all(fine, 0, params()).await,
        Err(OrchestratorError::InvalidConcurrency)
    );
}

#[test_log::test(tokio::test)]
async fn test_summary_serializes_to_json() {
    let jobs = vec![
        TestJob::succeeding("prices", 3).shared(),
        TestJob::failing("quotes", JobError::Validation("bad rows".into())).shared(),
    ];
    let outcome = orchestrator().run_all(jobs, 2, params()).await.unwrap();

    let json: serde_json::Value = serde_json::from_str(&outcome.summary.to_json().unwrap()).unwrap();
    assert_eq!(json["total_jobs"], 2);
    assert_eq!(json["succeeded"], 1);
    assert_eq!(json["failed_jobs"][0]["job_name"], "quotes");
    assert_eq!(json["run_id"], outcome.run_id.to_string());
}

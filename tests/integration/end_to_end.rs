//! Configured jobs from file drop to SQLite, through the orchestrator

use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::common::fixtures::{date, income, SlowFirstUpsert};
use crate::common::logging::log_test_step;
use crate::common::upstream::{MockFeed, MockedSource};
use pit_sync::api::UpstreamSource;
use pit_sync::batch_fetcher::BatchFetchJob;
use pit_sync::config::Config;
use pit_sync::database::{MemoryGateway, PersistenceGateway, SqliteGateway};
use pit_sync::error::{ErrorKind, UpstreamError};
use pit_sync::executor::{RetryPolicy, RetryingExecutor};
use pit_sync::jobs::builder::csv_sources;
use pit_sync::jobs::{build_registry, Job, PassthroughTransform, PitTransform, SyncJob};
use pit_sync::models::{DateRange, EntityKeys, JobSpec, JobStatus, UpdateMode};
use pit_sync::orchestrator::{RunParameters, TaskOrchestrator};
use pit_sync::reconcile::ledger;
use pit_sync::reconcile::{PitLedger, PitReconciler, SourcePriority};

const HEADER: &str = "entity,period_end,announce_date,revenue,net_income\n";

fn write_drop(data_dir: &Path, source: &str, lines: &[&str]) {
    let dir = data_dir.join(source);
    std::fs::create_dir_all(&dir).unwrap();
    let body: String = lines.iter().map(|l| format!("{}\n", l)).collect();
    std::fs::write(dir.join("income_statement.csv"), format!("{}{}", HEADER, body)).unwrap();
}

fn config(root: &Path) -> Config {
    let mut config = Config::from_toml_str(
        r#"
        [settings]
        lookback_days = 5

        [epochs]
        fundamentals = "2024-01-01"

        [[domains]]
        name = "income_statement"
        priority = ["edgar", "vendor"]
        fields = ["revenue", "net_income"]

        [[jobs]]
        name = "income_edgar"
        source = "edgar"
        api = "income_statement"
        table = "income_statement_pit"
        entity_type = "fundamentals"
        domain = "income_statement"
        batch = { kind = "monthly" }

        [[jobs]]
        name = "income_vendor"
        source = "vendor"
        api = "income_statement"
        table = "income_statement_pit"
        entity_type = "fundamentals"
        domain = "income_statement"
        dependencies = ["income_edgar"]
        "#,
    )
    .unwrap();
    config.settings.data_dir = root.join("data");
    config.settings.database_path = root.join("pit_sync.db");
    config
}

fn orchestrator() -> TaskOrchestrator {
    TaskOrchestrator::new(RetryingExecutor::new(RetryPolicy {
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        jitter: false,
        ..RetryPolicy::default()
    }))
}

async fn stored_ledger(gateway: &SqliteGateway) -> PitLedger {
    let records = gateway
        .rows("income_statement_pit", None)
        .await
        .unwrap()
        .iter()
        .map(|row| ledger::from_row(row).unwrap())
        .collect();
    let ledger = PitLedger::new();
    ledger.hydrate(records);
    ledger
}

#[test_log::test(tokio::test)]
async fn test_pit_sync_full_rerun_and_backfill() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let data_dir = &config.settings.data_dir;

    write_drop(
        data_dir,
        "edgar",
        &["AAPL,2023-12-30,2024-02-02,119575,33916", "MSFT,2023-12-31,2024-01-30,62020,21870"],
    );
    write_drop(
        data_dir,
        "vendor",
        &["AAPL,2023-12-30,2024-02-01,119600,33900", "MSFT,2023-12-31,2024-01-30,62000,"],
    );

    let gateway = Arc::new(SqliteGateway::new(&config.settings.database_path).await.unwrap());
    let today = date(2024, 3, 1);

    log_test_step("full load");
    let registry = build_registry(&config, gateway.clone(), &csv_sources(&config)).await.unwrap();
    let outcome = orchestrator()
        .run_all(registry.select("all").unwrap(), 2, RunParameters::new(UpdateMode::Full, today))
        .await
        .unwrap();
    assert_eq!(outcome.summary.exit_code(false), 0);
    assert_eq!(outcome.result("income_edgar").unwrap().rows_processed, 2);
    assert_eq!(outcome.result("income_vendor").unwrap().rows_processed, 2);

    let ledger = stored_ledger(&gateway).await;
    assert_eq!(ledger.len(), 4);
    let aapl = date(2023, 12, 30);
    assert_eq!(ledger.as_of("AAPL", aapl, date(2024, 1, 31)), None);
    assert_eq!(ledger.as_of("AAPL", aapl, date(2024, 2, 1)).unwrap().source, "vendor");
    assert_eq!(ledger.as_of("AAPL", aapl, date(2024, 2, 2)).unwrap().source, "edgar");
    assert_eq!(ledger.as_of("MSFT", date(2023, 12, 31), today).unwrap().source, "edgar");

    log_test_step("incremental rerun in a fresh process changes nothing");
    let registry = build_registry(&config, gateway.clone(), &csv_sources(&config)).await.unwrap();
    let outcome = orchestrator()
        .run_all(registry.select("all").unwrap(), 2, RunParameters::new(UpdateMode::Incremental, today))
        .await
        .unwrap();
    assert_eq!(outcome.summary.count(JobStatus::Success), 2);
    assert_eq!(outcome.summary.total_rows, 0);
    assert_eq!(stored_ledger(&gateway).await.len(), 4);

    log_test_step("late filing announced before the vendor figure");
    write_drop(
        data_dir,
        "edgar",
        &[
            "AAPL,2023-12-30,2024-01-31,119500,33900",
            "AAPL,2023-12-30,2024-02-02,119575,33916",
            "MSFT,2023-12-31,2024-01-30,62020,21870",
        ],
    );
    let registry = build_registry(&config, gateway.clone(), &csv_sources(&config)).await.unwrap();
    let outcome = orchestrator()
        .run_all(
            registry.select("income_edgar").unwrap(),
            1,
            RunParameters::new(UpdateMode::Incremental, today),
        )
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.summary.total_rows, 2);

    let ledger = stored_ledger(&gateway).await;
    assert_eq!(ledger.len(), 6);
    let known = ledger.as_of("AAPL", aapl, date(2024, 2, 1)).unwrap();
    assert_eq!(known.source, "edgar");
    assert_eq!(known.announce_date, date(2024, 1, 31));
    assert_eq!(ledger.as_of("AAPL", aapl, date(2024, 1, 30)), None);
}

#[test_log::test(tokio::test)]
async fn test_each_source_plans_from_its_own_watermark() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let data_dir = &config.settings.data_dir;
    let incremental = RunParameters::new(UpdateMode::Incremental, date(2024, 6, 1));

    // The filing source is far ahead of the vendor
    write_drop(data_dir, "edgar", &["AAPL,2024-03-30,2024-05-01,90753,23636"]);
    write_drop(data_dir, "vendor", &["AAPL,2023-12-30,2024-01-15,119600,33900"]);

    let gateway = Arc::new(SqliteGateway::new(&config.settings.database_path).await.unwrap());

    log_test_step("first incremental run on an empty database");
    let registry = build_registry(&config, gateway.clone(), &csv_sources(&config)).await.unwrap();
    let outcome = orchestrator()
        .run_all(registry.select("all").unwrap(), 2, incremental)
        .await
        .unwrap();
    assert_eq!(outcome.result("income_edgar").unwrap().rows_processed, 1);
    assert_eq!(outcome.result("income_vendor").unwrap().rows_processed, 1);

    let ledger = stored_ledger(&gateway).await;
    let q4 = ledger.as_of("AAPL", date(2023, 12, 30), date(2024, 6, 1)).unwrap();
    assert_eq!(q4.source, "vendor");
    assert_eq!(
        gateway.source_watermark("income_statement_pit", "vendor", None).await.unwrap(),
        Some(date(2024, 1, 15))
    );
    assert_eq!(
        gateway.source_watermark("income_statement_pit", "edgar", None).await.unwrap(),
        Some(date(2024, 5, 1))
    );

    log_test_step("vendor publishes between its own watermark and the filing's");
    write_drop(
        data_dir,
        "vendor",
        &["AAPL,2023-12-30,2024-01-15,119600,33900", "AAPL,2024-03-30,2024-04-20,90800,23600"],
    );
    let registry = build_registry(&config, gateway.clone(), &csv_sources(&config)).await.unwrap();
    let outcome = orchestrator()
        .run_all(registry.select("all").unwrap(), 2, incremental)
        .await
        .unwrap();
    assert_eq!(outcome.result("income_edgar").unwrap().rows_processed, 0);
    assert_eq!(outcome.result("income_vendor").unwrap().rows_processed, 1);

    let ledger = stored_ledger(&gateway).await;
    assert_eq!(ledger.len(), 3);
    let q1 = date(2024, 3, 30);
    assert_eq!(ledger.as_of("AAPL", q1, date(2024, 4, 25)).unwrap().source, "vendor");
    assert_eq!(ledger.as_of("AAPL", q1, date(2024, 5, 1)).unwrap().source, "edgar");
}

#[test_log::test(tokio::test)]
async fn test_timed_out_upsert_is_rewritten_on_retry() {
    let mut feed = MockFeed::new();
    feed.expect_fetch()
        .times(2)
        .returning(|_, _| Ok(vec![income("AAPL", "edgar", date(2024, 1, 3), 100.0)]));
    let source: Arc<dyn UpstreamSource> = Arc::new(MockedSource::new("edgar", feed));

    let gateway = SlowFirstUpsert::new(Duration::from_millis(300));
    let ledger = Arc::new(PitLedger::new());
    let reconciler = Arc::new(PitReconciler::new(
        SourcePriority::new("income_statement", ["edgar"]),
        vec!["revenue".to_string(), "net_income".to_string()],
    ));

    let job: Arc<dyn Job> = Arc::new(SyncJob::new(
        JobSpec::new("income_edgar", "edgar"),
        "income_statement_pit",
        BatchFetchJob::new(source, "income_statement"),
        Arc::new(PitTransform::new(reconciler, ledger.clone())),
        gateway.clone(),
    ));

    let executor = RetryingExecutor::new(RetryPolicy {
        max_retries: 2,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        timeout: Duration::from_millis(100),
        jitter: false,
        ..RetryPolicy::default()
    });
    let outcome = TaskOrchestrator::new(executor)
        .run_all(vec![job], 1, RunParameters::new(UpdateMode::Full, date(2024, 1, 5)))
        .await
        .unwrap();

    let result = outcome.result("income_edgar").unwrap();
    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(result.attempts, 2);
    assert!(result.metadata["attempt_1_error"].contains("timed out"));
    assert_eq!(result.rows_processed, 1);
    assert_eq!(gateway.inner.row_count("income_statement_pit").await, 1);
    assert_eq!(ledger.len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_rate_limited_batch_is_retried_then_persisted() {
    let mut feed = MockFeed::new();
    let mut calls = 0;
    feed.expect_fetch().times(2).returning(move |_, params| {
        calls += 1;
        if calls == 1 {
            return Err(UpstreamError::RateLimited { retry_after: None });
        }
        Ok(params
            .entities
            .iter()
            .map(|entity| income(entity, "vendor", params.end_date, 10.0))
            .collect())
    });
    let source: Arc<dyn UpstreamSource> = Arc::new(MockedSource::new("vendor", feed));
    let gateway = Arc::new(MemoryGateway::new());

    let job: Arc<dyn Job> = Arc::new(SyncJob::new(
        JobSpec::new("quotes", "vendor").with_entities(EntityKeys::list(["AAPL", "MSFT"])),
        "quotes",
        BatchFetchJob::new(source, "quotes"),
        Arc::new(PassthroughTransform),
        gateway.clone(),
    ));

    let outcome = orchestrator()
        .run_all(
            vec![job],
            1,
            RunParameters::new(UpdateMode::Full, date(2024, 1, 5)),
        )
        .await
        .unwrap();

    let result = outcome.result("quotes").unwrap();
    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(result.attempts, 2);
    assert!(result.metadata["attempt_1_error"].contains("rate limited"));
    assert_eq!(gateway.row_count("quotes").await, 2);
}

#[test_log::test(tokio::test)]
async fn test_auth_failure_fails_fast_and_skips_dependents() {
    let mut feed = MockFeed::new();
    feed.expect_fetch()
        .times(1)
        .returning(|_, _| Err(UpstreamError::Auth("token expired".into())));
    let mut sources: HashMap<String, Arc<dyn UpstreamSource>> = HashMap::new();
    sources.insert("edgar".into(), Arc::new(MockedSource::new("edgar", feed)));
    sources.insert("vendor".into(), Arc::new(MockedSource::new("vendor", MockFeed::new())));

    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let registry = build_registry(&config, Arc::new(MemoryGateway::new()), &sources)
        .await
        .unwrap();

    // January is a single monthly batch, so edgar sees exactly one call
    let params = RunParameters::new(UpdateMode::Manual, date(2024, 3, 1))
        .with_manual_range(DateRange::new(date(2024, 1, 1), date(2024, 1, 31)));
    let outcome = orchestrator()
        .run_all(registry.select("all").unwrap(), 2, params)
        .await
        .unwrap();

    let edgar = outcome.result("income_edgar").unwrap();
    assert_eq!(edgar.status, JobStatus::Failed);
    assert_eq!(edgar.attempts, 1);
    assert_eq!(edgar.error_kind, Some(ErrorKind::Auth));

    let vendor = outcome.result("income_vendor").unwrap();
    assert_eq!(vendor.status, JobStatus::Skipped);
    assert_eq!(vendor.error_kind, Some(ErrorKind::DependencyFailed));
    assert_eq!(outcome.summary.exit_code(false), 1);
}

//! Shared builders for records and jobs

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pit_sync::database::{MemoryGateway, PersistenceGateway, Row};
use pit_sync::error::{GatewayError, JobError};
use pit_sync::jobs::{Job, JobContext, JobOutput};
use pit_sync::models::{JobSpec, RawRecord};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// One income figure for `entity` for the quarter ending 2023-12-31
pub fn income(entity: &str, source: &str, announced: NaiveDate, revenue: f64) -> RawRecord {
    RawRecord::new(entity, date(2023, 12, 31), announced, source)
        .with_field("revenue", Some(revenue))
        .with_field("net_income", Some(revenue / 10.0))
}

/// Tracks how many jobs run at the same time
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed { rows: u64, delay: Duration },
    Fail(JobError),
    Panic(&'static str),
}

/// A job whose every attempt behaves the same way
pub struct TestJob {
    spec: JobSpec,
    behavior: Behavior,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl TestJob {
    pub fn succeeding(name: &str, rows: u64) -> Self {
        Self::new(
            name,
            Behavior::Succeed {
                rows,
                delay: Duration::from_millis(5),
            },
        )
    }

    pub fn slow(name: &str, delay: Duration) -> Self {
        Self::new(name, Behavior::Succeed { rows: 1, delay })
    }

    pub fn failing(name: &str, error: JobError) -> Self {
        Self::new(name, Behavior::Fail(error))
    }

    pub fn panicking(name: &str, message: &'static str) -> Self {
        Self::new(name, Behavior::Panic(message))
    }

    fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            spec: JobSpec::new(name, "test"),
            behavior,
            gauge: None,
        }
    }

    pub fn depends_on(mut self, dependency: &str) -> Self {
        self.spec = self.spec.depends_on(dependency);
        self
    }

    pub fn gauged(mut self, gauge: &Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(Arc::clone(gauge));
        self
    }

    pub fn shared(self) -> Arc<dyn Job> {
        Arc::new(self)
    }
}

#[async_trait]
impl Job for TestJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn run(&self, _ctx: &JobContext) -> Result<JobOutput, JobError> {
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        let outcome = match &self.behavior {
            Behavior::Succeed { rows, delay } => {
                tokio::time::sleep(*delay).await;
                Ok(JobOutput::rows(*rows))
            }
            Behavior::Fail(error) => Err(error.clone()),
            Behavior::Panic(message) => panic!("{}", message),
        };
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        outcome
    }
}

/// In-memory gateway whose first upsert sleeps before writing
pub struct SlowFirstUpsert {
    pub inner: MemoryGateway,
    stall: Duration,
    stalled: AtomicBool,
}

impl SlowFirstUpsert {
    pub fn new(stall: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryGateway::new(),
            stall,
            stalled: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PersistenceGateway for SlowFirstUpsert {
    async fn upsert(&self, table: &str, rows: &[Row], primary_key: &[String]) -> Result<u64, GatewayError> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.upsert(table, rows, primary_key).await
    }

    async fn latest_watermark(&self, table: &str, entity: Option<&str>) -> Result<Option<NaiveDate>, GatewayError> {
        self.inner.latest_watermark(table, entity).await
    }

    async fn source_watermark(
        &self,
        table: &str,
        source: &str,
        entity: Option<&str>,
    ) -> Result<Option<NaiveDate>, GatewayError> {
        self.inner.source_watermark(table, source, entity).await
    }

    async fn rows(&self, table: &str, entity: Option<&str>) -> Result<Vec<Row>, GatewayError> {
        self.inner.rows(table, entity).await
    }

    async fn watermarks(&self, table: &str) -> Result<Vec<(String, NaiveDate)>, GatewayError> {
        self.inner.watermarks(table).await
    }
}

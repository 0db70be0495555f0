use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;

use crate::error::UpstreamError;
use crate::models::RawRecord;

pub mod csv_source;
pub use csv_source::CsvSource;

/// Parameters of one upstream batch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchParams {
    /// Empty means every entity the source knows about
    pub entities: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub batch_number: usize,
}

/// An upstream data source. Implementations classify their failures so the
/// executor can tell retryable errors from fatal ones.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_batch(
        &self,
        api_name: &str,
        params: &BatchParams,
    ) -> Result<Vec<RawRecord>, UpstreamError>;
}

/// Request pacing shared by every batch of one job
pub struct RequestPacer {
    limiter: DefaultDirectRateLimiter,
}

impl RequestPacer {
    /// `None` when `requests_per_minute` is zero
    pub fn per_minute(requests_per_minute: u32) -> Option<Self> {
        let rate = NonZeroU32::new(requests_per_minute)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_minute(rate)),
        })
    }

    pub async fn wait(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer").finish_non_exhaustive()
    }
}

//! Common test utilities and helpers

#![allow(dead_code)]

pub mod fixtures;

/// Mocked upstream delivery
pub mod upstream {
    use async_trait::async_trait;
    use mockall::automock;
    use pit_sync::api::{BatchParams, UpstreamSource};
    use pit_sync::error::UpstreamError;
    use pit_sync::models::RawRecord;

    /// What the mock answers for each batch request
    #[automock]
    pub trait Feed: Send + Sync {
        fn fetch(&self, api_name: &str, params: &BatchParams) -> Result<Vec<RawRecord>, UpstreamError>;
    }

    /// An [`UpstreamSource`] whose batches come from a [`MockFeed`]
    pub struct MockedSource {
        pub name: String,
        pub feed: MockFeed,
    }

    impl MockedSource {
        pub fn new(name: &str, feed: MockFeed) -> Self {
            Self {
                name: name.to_string(),
                feed,
            }
        }
    }

    #[async_trait]
    impl UpstreamSource for MockedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch_batch(
            &self,
            api_name: &str,
            params: &BatchParams,
        ) -> Result<Vec<RawRecord>, UpstreamError> {
            self.feed.fetch(api_name, params)
        }
    }
}

/// Logging utilities for tests
pub mod logging {
    use std::sync::Once;
    use tracing::info;

    static INIT: Once = Once::new();

    /// For tests that do not go through `test_log::test`
    pub fn init_test_logging() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter("pit_sync=debug")
                .with_test_writer()
                .try_init();
        });
    }

    pub fn log_test_step(step: &str) {
        info!("🧪 Test Step: {}", step);
    }
}

//! Startup wiring: configuration in, job registry out.

use anyhow::{anyhow, Context};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::sync_job::{PassthroughTransform, PitTransform, RowTransform, SyncJob};
use crate::api::{CsvSource, RequestPacer, UpstreamSource};
use crate::batch_fetcher::BatchFetchJob;
use crate::config::Config;
use crate::database::PersistenceGateway;
use crate::orchestrator::JobRegistry;
use crate::reconcile::ledger::{self, PitLedger};

/// One file-drop source per source name the jobs reference
pub fn csv_sources(config: &Config) -> HashMap<String, Arc<dyn UpstreamSource>> {
    config
        .jobs
        .iter()
        .map(|job| {
            let source: Arc<dyn UpstreamSource> =
                Arc::new(CsvSource::new(job.source.clone(), config.settings.data_dir.clone()));
            (job.source.clone(), source)
        })
        .collect()
}

/// Build every configured job. PIT tables share one ledger, hydrated from
/// what the gateway already holds.
pub async fn build_registry(
    config: &Config,
    gateway: Arc<dyn PersistenceGateway>,
    sources: &HashMap<String, Arc<dyn UpstreamSource>>,
) -> anyhow::Result<JobRegistry> {
    let planner = Arc::new(config.range_planner());
    let mut ledgers: HashMap<String, Arc<PitLedger>> = HashMap::new();
    let mut registry = JobRegistry::new();

    for job in &config.jobs {
        let source = sources
            .get(&job.source)
            .cloned()
            .ok_or_else(|| anyhow!("job '{}' uses unknown source '{}'", job.name, job.source))?;

        let transform: Arc<dyn RowTransform> = match &job.domain {
            None => Arc::new(PassthroughTransform),
            Some(domain_name) => {
                let domain = config
                    .domain(domain_name)
                    .ok_or_else(|| anyhow!("job '{}' uses unknown domain '{}'", job.name, domain_name))?;

                let ledger = match ledgers.get(&job.table) {
                    Some(ledger) => Arc::clone(ledger),
                    None => {
                        let ledger = Arc::new(PitLedger::new());
                        let rows = gateway
                            .rows(&job.table, None)
                            .await
                            .with_context(|| format!("cannot load stored rows of {}", job.table))?;
                        let records = rows
                            .iter()
                            .map(ledger::from_row)
                            .collect::<Result<Vec<_>, _>>()
                            .with_context(|| format!("stored rows of {} are not PIT rows", job.table))?;
                        info!("📚 Hydrated {} revisions for {}", records.len(), job.table);
                        ledger.hydrate(records);
                        ledgers.insert(job.table.clone(), Arc::clone(&ledger));
                        ledger
                    }
                };
                Arc::new(PitTransform::new(Arc::new(domain.reconciler()), ledger))
            }
        };

        let fetcher = BatchFetchJob::new(source, job.api.clone())
            .with_policy(job.batch)
            .with_entity_chunk(job.entity_chunk)
            .with_max_in_flight(job.max_in_flight)
            .with_validator(job.validator())
            .with_pacer(job.requests_per_minute.and_then(RequestPacer::per_minute));

        let sync_job = SyncJob::new(job.spec(), job.table.clone(), fetcher, transform, Arc::clone(&gateway))
            .with_planner(Arc::clone(&planner), job.entity_type.clone())
            .with_lookback_days(job.lookback_days.unwrap_or(config.settings.lookback_days))
            .best_effort(job.best_effort);

        registry.register(Arc::new(sync_job))?;
    }

    Ok(registry)
}

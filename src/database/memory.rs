use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{max_dates, PersistenceGateway, Row};
use crate::error::GatewayError;

#[derive(Debug, Default)]
struct TableState {
    rows: BTreeMap<String, Row>,
    /// Keyed by `(entity, source)`
    watermarks: BTreeMap<(String, String), NaiveDate>,
}

impl TableState {
    fn latest(&self, mut scope: impl FnMut(&str, &str) -> bool) -> Option<NaiveDate> {
        self.watermarks
            .iter()
            .filter(|((entity, source), _)| scope(entity, source))
            .map(|(_, date)| *date)
            .max()
    }
}

/// In-process gateway with the same upsert and watermark rules as SQLite
#[derive(Debug, Default)]
pub struct MemoryGateway {
    tables: RwLock<BTreeMap<String, TableState>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.read().await;
        tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        primary_key: &[String],
    ) -> Result<u64, GatewayError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // Encode every key before touching state so a bad row changes nothing
        let keyed = rows
            .iter()
            .map(|row| -> Result<_, GatewayError> { Ok((row.primary_key(table, primary_key)?, row)) })
            .collect::<Result<Vec<_>, GatewayError>>()?;

        let mut tables = self.tables.write().await;
        let state = tables.entry(table.to_string()).or_default();

        let mut affected = 0u64;
        for (key, row) in keyed {
            if state.rows.get(&key) != Some(row) {
                state.rows.insert(key, row.clone());
                affected += 1;
            }
        }

        for ((entity, source), latest) in max_dates(rows) {
            state
                .watermarks
                .entry((entity.to_string(), source.to_string()))
                .and_modify(|d| *d = (*d).max(latest))
                .or_insert(latest);
        }

        debug!("💾 Upserted {} rows into {} ({} changed)", rows.len(), table, affected);
        Ok(affected)
    }

    async fn latest_watermark(
        &self,
        table: &str,
        entity: Option<&str>,
    ) -> Result<Option<NaiveDate>, GatewayError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .and_then(|state| state.latest(|e, _| entity.map_or(true, |wanted| e == wanted))))
    }

    async fn source_watermark(
        &self,
        table: &str,
        source: &str,
        entity: Option<&str>,
    ) -> Result<Option<NaiveDate>, GatewayError> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|state| {
            state.latest(|e, s| s == source && entity.map_or(true, |wanted| e == wanted))
        }))
    }

    async fn rows(&self, table: &str, entity: Option<&str>) -> Result<Vec<Row>, GatewayError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|state| {
                state
                    .rows
                    .values()
                    .filter(|row| entity.map_or(true, |e| row.entity == e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watermarks(&self, table: &str) -> Result<Vec<(String, NaiveDate)>, GatewayError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|state| {
                let mut per_entity: BTreeMap<String, NaiveDate> = BTreeMap::new();
                for ((entity, _), date) in &state.watermarks {
                    per_entity
                        .entry(entity.clone())
                        .and_modify(|d| *d = (*d).max(*date))
                        .or_insert(*date);
                }
                per_entity.into_iter().collect()
            })
            .unwrap_or_default())
    }
}

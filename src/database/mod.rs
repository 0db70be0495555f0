//! Persistence gateway: idempotent upserts and per-entity watermarks.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

use crate::error::GatewayError;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;

/// One normalized row bound for a table.
///
/// `entity` and `date` are always present and drive the watermark; everything
/// else lives in `values`. A string `source` value scopes the watermark to
/// that source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub entity: String,
    pub date: NaiveDate,
    pub values: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(entity: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            entity: entity.into(),
            date,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn column(&self, name: &str) -> Option<Value> {
        match name {
            "entity" => Some(Value::String(self.entity.clone())),
            "date" => Some(Value::String(self.date.format("%Y-%m-%d").to_string())),
            other => self.values.get(other).cloned(),
        }
    }

    /// Watermark scope of this row; empty when the row names no source
    pub fn source(&self) -> &str {
        self.values.get("source").and_then(Value::as_str).unwrap_or_default()
    }

    /// Encoded primary key; a JSON array of the key column values
    pub fn primary_key(&self, table: &str, primary_key: &[String]) -> Result<String, GatewayError> {
        let parts = primary_key
            .iter()
            .map(|column| {
                self.column(column)
                    .ok_or_else(|| GatewayError::MissingKeyColumn {
                        table: table.to_string(),
                        column: column.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(serde_json::to_string(&parts)?)
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Insert or update rows, returning how many rows actually changed.
    /// Re-applying identical rows returns 0. Watermarks only move forward.
    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        primary_key: &[String],
    ) -> Result<u64, GatewayError>;

    /// Latest persisted date for one entity, or for the whole table when
    /// `entity` is `None`, across every source
    async fn latest_watermark(
        &self,
        table: &str,
        entity: Option<&str>,
    ) -> Result<Option<NaiveDate>, GatewayError>;

    /// Like `latest_watermark`, counting only rows written for `source`.
    /// Tables fed by several sources must plan each source from this.
    async fn source_watermark(
        &self,
        table: &str,
        source: &str,
        entity: Option<&str>,
    ) -> Result<Option<NaiveDate>, GatewayError>;

    async fn rows(&self, table: &str, entity: Option<&str>) -> Result<Vec<Row>, GatewayError>;

    /// Every `(entity, watermark)` pair of a table, ordered by entity
    async fn watermarks(&self, table: &str) -> Result<Vec<(String, NaiveDate)>, GatewayError>;
}

/// Async locks keyed by `(table, entity)`.
///
/// Writes for disjoint entities proceed in parallel; writes touching the same
/// pair are serialized.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every entity lock touched by `rows`, in sorted order
    pub async fn lock_rows(&self, table: &str, rows: &[Row]) -> Vec<OwnedMutexGuard<()>> {
        let entities: BTreeSet<&str> = rows.iter().map(|r| r.entity.as_str()).collect();
        let mut guards = Vec::with_capacity(entities.len());
        for entity in entities {
            guards.push(self.lock(table, entity).await);
        }
        guards
    }

    pub async fn lock(&self, table: &str, entity: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Only the map holds an idle lock; guards and waiters keep a clone
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((table.to_string(), entity.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Highest row date per `(entity, source)`
pub(crate) fn max_dates(rows: &[Row]) -> BTreeMap<(&str, &str), NaiveDate> {
    let mut latest: BTreeMap<(&str, &str), NaiveDate> = BTreeMap::new();
    for row in rows {
        latest
            .entry((row.entity.as_str(), row.source()))
            .and_modify(|d| *d = (*d).max(row.date))
            .or_insert(row.date);
    }
    latest
}

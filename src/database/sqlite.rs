use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{max_dates, KeyedLocks, PersistenceGateway, Row};
use crate::error::GatewayError;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed gateway.
///
/// Every logical table shares one `records` table keyed by `(table_name, pk)`
/// with a JSON payload, plus a `watermarks` table keyed by
/// `(table_name, entity, source)`.
#[derive(Debug, Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
    locks: Arc<KeyedLocks>,
}

impl SqliteGateway {
    /// Open (creating if needed) the database at `path` and ensure the schema
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        let gateway = Self {
            pool,
            locks: Arc::new(KeyedLocks::new()),
        };
        gateway.ensure_schema().await?;
        info!("✅ Database ready at {}", path.as_ref().display());
        Ok(gateway)
    }

    /// Open an existing database without creating or migrating anything
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            locks: Arc::new(KeyedLocks::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                table_name TEXT NOT NULL,
                pk TEXT NOT NULL,
                entity TEXT NOT NULL,
                date TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (table_name, pk)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_table_entity ON records(table_name, entity, date)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watermarks (
                table_name TEXT NOT NULL,
                entity TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                latest_date TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (table_name, entity, source)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn tables(&self) -> Result<Vec<(String, i64)>, GatewayError> {
        let rows = sqlx::query(
            "SELECT table_name, COUNT(*) AS count FROM records GROUP BY table_name ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("table_name"), r.get::<i64, _>("count")))
            .collect())
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, GatewayError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| GatewayError::Corrupt(format!("invalid date '{}': {}", raw, e)))
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        primary_key: &[String],
    ) -> Result<u64, GatewayError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let encoded = rows
            .iter()
            .map(|row| -> Result<_, GatewayError> {
                Ok((
                    row.primary_key(table, primary_key)?,
                    serde_json::to_string(&row.values)?,
                    row,
                ))
            })
            .collect::<Result<Vec<_>, GatewayError>>()?;

        let _guards = self.locks.lock_rows(table, rows).await;
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;

        for (pk, payload, row) in &encoded {
            let result = sqlx::query(
                r#"
                INSERT INTO records (table_name, pk, entity, date, payload)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(table_name, pk) DO UPDATE SET
                    entity = excluded.entity,
                    date = excluded.date,
                    payload = excluded.payload,
                    updated_at = CURRENT_TIMESTAMP
                WHERE records.payload IS NOT excluded.payload
                   OR records.date IS NOT excluded.date
                   OR records.entity IS NOT excluded.entity
                "#,
            )
            .bind(table)
            .bind(pk)
            .bind(&row.entity)
            .bind(row.date.format(DATE_FORMAT).to_string())
            .bind(payload)
            .execute(&mut *tx)
            .await?;
            affected += result.rows_affected();
        }

        for ((entity, source), latest) in max_dates(rows) {
            sqlx::query(
                r#"
                INSERT INTO watermarks (table_name, entity, source, latest_date)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(table_name, entity, source) DO UPDATE SET
                    latest_date = MAX(watermarks.latest_date, excluded.latest_date),
                    updated_at = CURRENT_TIMESTAMP
                WHERE excluded.latest_date > watermarks.latest_date
                "#,
            )
            .bind(table)
            .bind(entity)
            .bind(source)
            .bind(latest.format(DATE_FORMAT).to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("💾 Upserted {} rows into {} ({} changed)", rows.len(), table, affected);
        Ok(affected)
    }

    async fn latest_watermark(
        &self,
        table: &str,
        entity: Option<&str>,
    ) -> Result<Option<NaiveDate>, GatewayError> {
        let latest: Option<String> = sqlx::query_scalar(
            "SELECT MAX(latest_date) FROM watermarks WHERE table_name = ? AND (? IS NULL OR entity = ?)",
        )
        .bind(table)
        .bind(entity)
        .bind(entity)
        .fetch_one(&self.pool)
        .await?;

        latest.as_deref().map(parse_date).transpose()
    }

    async fn source_watermark(
        &self,
        table: &str,
        source: &str,
        entity: Option<&str>,
    ) -> Result<Option<NaiveDate>, GatewayError> {
        let latest: Option<String> = sqlx::query_scalar(
            r#"
            SELECT MAX(latest_date) FROM watermarks
            WHERE table_name = ? AND source = ? AND (? IS NULL OR entity = ?)
            "#,
        )
        .bind(table)
        .bind(source)
        .bind(entity)
        .bind(entity)
        .fetch_one(&self.pool)
        .await?;

        latest.as_deref().map(parse_date).transpose()
    }

    async fn rows(&self, table: &str, entity: Option<&str>) -> Result<Vec<Row>, GatewayError> {
        let records = sqlx::query(
            r#"
            SELECT entity, date, payload FROM records
            WHERE table_name = ? AND (? IS NULL OR entity = ?)
            ORDER BY entity, date, pk
            "#,
        )
        .bind(table)
        .bind(entity)
        .bind(entity)
        .fetch_all(&self.pool)
        .await?;

        records
            .iter()
            .map(|record| -> Result<Row, GatewayError> {
                let values: BTreeMap<String, serde_json::Value> =
                    serde_json::from_str(&record.get::<String, _>("payload"))?;
                Ok(Row {
                    entity: record.get("entity"),
                    date: parse_date(&record.get::<String, _>("date"))?,
                    values,
                })
            })
            .collect()
    }

    async fn watermarks(&self, table: &str) -> Result<Vec<(String, NaiveDate)>, GatewayError> {
        let rows = sqlx::query(
            r#"
            SELECT entity, MAX(latest_date) AS latest_date FROM watermarks
            WHERE table_name = ?
            GROUP BY entity
            ORDER BY entity
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<(String, NaiveDate), GatewayError> {
                Ok((
                    r.get::<String, _>("entity"),
                    parse_date(&r.get::<String, _>("latest_date"))?,
                ))
            })
            .collect()
    }
}

//! SQLite gateway tests against temporary database files

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

use crate::common::fixtures::date;
use pit_sync::database::{PersistenceGateway, Row, SqliteGateway};
use pit_sync::error::GatewayError;

async fn gateway() -> (TempDir, SqliteGateway) {
    let dir = tempfile::tempdir().unwrap();
    let gateway = SqliteGateway::new(dir.path().join("pit_sync.db")).await.unwrap();
    (dir, gateway)
}

fn key() -> Vec<String> {
    vec!["entity".to_string(), "date".to_string()]
}

fn price(entity: &str, day: u32, close: f64) -> Row {
    Row::new(entity, date(2024, 1, day)).with_value("close", close)
}

#[test_log::test(tokio::test)]
async fn test_upsert_is_idempotent() {
    let (_dir, gateway) = gateway().await;
    let rows = vec![price("AAPL", 2, 185.6), price("AAPL", 3, 184.3), price("MSFT", 2, 370.9)];

    assert_eq!(gateway.upsert("daily_prices", &rows, &key()).await.unwrap(), 3);
    assert_eq!(gateway.upsert("daily_prices", &rows, &key()).await.unwrap(), 0);
    assert_eq!(gateway.rows("daily_prices", None).await.unwrap().len(), 3);

    let corrected = vec![price("AAPL", 3, 184.5)];
    assert_eq!(gateway.upsert("daily_prices", &corrected, &key()).await.unwrap(), 1);

    let stored = gateway.rows("daily_prices", Some("AAPL")).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.contains(&price("AAPL", 3, 184.5)));
}

#[test_log::test(tokio::test)]
async fn test_watermarks_per_entity_and_table() {
    let (_dir, gateway) = gateway().await;
    assert_eq!(gateway.latest_watermark("daily_prices", None).await.unwrap(), None);

    let rows = vec![price("AAPL", 10, 1.0), price("MSFT", 4, 1.0)];
    gateway.upsert("daily_prices", &rows, &key()).await.unwrap();

    // Older rows never move a watermark back
    gateway
        .upsert("daily_prices", &[price("AAPL", 2, 1.0)], &key())
        .await
        .unwrap();

    assert_eq!(
        gateway.latest_watermark("daily_prices", Some("AAPL")).await.unwrap(),
        Some(date(2024, 1, 10))
    );
    assert_eq!(
        gateway.latest_watermark("daily_prices", None).await.unwrap(),
        Some(date(2024, 1, 10))
    );
    assert_eq!(
        gateway.watermarks("daily_prices").await.unwrap(),
        vec![("AAPL".to_string(), date(2024, 1, 10)), ("MSFT".to_string(), date(2024, 1, 4))]
    );
    assert_eq!(gateway.latest_watermark("other_table", None).await.unwrap(), None);
}

#[test_log::test(tokio::test)]
async fn test_watermarks_are_kept_per_source() {
    let (_dir, gateway) = gateway().await;
    let key = vec!["entity".to_string(), "date".to_string(), "source".to_string()];
    let filing = |source: &str, month: u32, day: u32| {
        Row::new("AAPL", date(2024, month, day)).with_value("source", source.to_string())
    };

    gateway
        .upsert("income_pit", &[filing("edgar", 5, 1), filing("vendor", 1, 15)], &key)
        .await
        .unwrap();
    gateway
        .upsert("income_pit", &[filing("vendor", 1, 10)], &key)
        .await
        .unwrap();

    assert_eq!(
        gateway.source_watermark("income_pit", "vendor", Some("AAPL")).await.unwrap(),
        Some(date(2024, 1, 15))
    );
    assert_eq!(
        gateway.source_watermark("income_pit", "edgar", None).await.unwrap(),
        Some(date(2024, 5, 1))
    );
    assert_eq!(gateway.source_watermark("income_pit", "simfin", None).await.unwrap(), None);
    assert_eq!(
        gateway.latest_watermark("income_pit", Some("AAPL")).await.unwrap(),
        Some(date(2024, 5, 1))
    );
    assert_eq!(
        gateway.watermarks("income_pit").await.unwrap(),
        vec![("AAPL".to_string(), date(2024, 5, 1))]
    );
}

#[test_log::test(tokio::test)]
async fn test_missing_key_column_writes_nothing() {
    let (_dir, gateway) = gateway().await;
    let rows = vec![price("AAPL", 2, 1.0)];
    let primary_key = vec!["entity".to_string(), "source".to_string()];

    let err = gateway.upsert("daily_prices", &rows, &primary_key).await.unwrap_err();
    assert_matches!(err, GatewayError::MissingKeyColumn { column, .. } if column == "source");
    assert!(gateway.rows("daily_prices", None).await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_concurrent_upserts_for_disjoint_entities() {
    let (_dir, gateway) = gateway().await;
    let gateway = Arc::new(gateway);

    let mut handles = Vec::new();
    for entity in ["AAPL", "MSFT", "GOOG", "AMZN"] {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            let rows: Vec<Row> = (1..=5).map(|day| price(entity, day, f64::from(day))).collect();
            gateway.upsert("daily_prices", &rows, &key()).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 5);
    }

    assert_eq!(gateway.tables().await.unwrap(), vec![("daily_prices".to_string(), 20)]);
}

#[test_log::test(tokio::test)]
async fn test_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pit_sync.db");
    {
        let gateway = SqliteGateway::new(&path).await.unwrap();
        gateway
            .upsert("daily_prices", &[price("AAPL", 5, 1.0)], &key())
            .await
            .unwrap();
        gateway.pool().close().await;
    }

    let reader = SqliteGateway::new(&path).await.unwrap();
    assert_eq!(
        reader.latest_watermark("daily_prices", Some("AAPL")).await.unwrap(),
        Some(date(2024, 1, 5))
    );
}

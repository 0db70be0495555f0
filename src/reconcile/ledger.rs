//! Append-only, bitemporal store of reconciled PIT rows.
//!
//! Every natural key keeps its full revision history. When a late backfill or a
//! restatement changes which record wins a snapshot, the affected keys receive a
//! new revision instead of having their stored rows rewritten.

use chrono::NaiveDate;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::database::Row;
use crate::error::GatewayError;
use crate::models::{DataQuality, PitKey, PitRecord};
use crate::reconcile::pit::PitReconciler;

/// Primary key columns of a PIT table
pub const PIT_PRIMARY_KEY: [&str; 5] = ["entity", "period_end", "announce_date", "source", "revision"];

pub fn pit_primary_key() -> Vec<String> {
    PIT_PRIMARY_KEY.iter().map(|c| c.to_string()).collect()
}

#[derive(Debug, Default)]
pub struct PitLedger {
    revisions: RwLock<BTreeMap<PitKey, Vec<PitRecord>>>,
    /// Held from `merge` until the appended revisions are persisted or forgotten
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl PitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load previously persisted revisions
    pub fn hydrate(&self, records: Vec<PitRecord>) {
        let mut revisions = self.revisions.write().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            let history = revisions.entry(record.key()).or_default();
            if history.iter().all(|r| r.revision != record.revision) {
                history.push(record);
                history.sort_by_key(|r| r.revision);
            }
        }
    }

    /// Fold freshly reconciled records into the ledger.
    ///
    /// Authority is recomputed over each touched `(entity, period_end)` group,
    /// including everything already stored for it. Returns only the revisions
    /// that were appended; merging the same input twice appends nothing.
    pub fn merge(&self, reconciler: &PitReconciler, incoming: Vec<PitRecord>) -> Vec<PitRecord> {
        let mut revisions = self.revisions.write().unwrap_or_else(PoisonError::into_inner);

        let touched: BTreeSet<(String, NaiveDate)> = incoming
            .iter()
            .map(|r| (r.entity.clone(), r.period_end))
            .collect();

        let mut candidates: BTreeMap<(String, NaiveDate), BTreeMap<PitKey, PitRecord>> =
            BTreeMap::new();
        for (key, history) in revisions.iter() {
            let group = (key.entity.clone(), key.period_end);
            if !touched.contains(&group) {
                continue;
            }
            if let Some(latest) = history.last() {
                candidates
                    .entry(group)
                    .or_default()
                    .insert(key.clone(), latest.clone());
            }
        }
        for record in incoming {
            candidates
                .entry((record.entity.clone(), record.period_end))
                .or_default()
                .insert(record.key(), record);
        }

        let mut appended = Vec::new();
        for (_, members) in candidates {
            let mut group: Vec<PitRecord> = members.into_values().collect();
            reconciler.mark_authority(&mut group);

            for mut record in group {
                let key = record.key();
                let history = revisions.entry(key).or_default();
                match history.last() {
                    Some(latest) if latest.same_content(&record) => continue,
                    Some(latest) => record.revision = latest.revision + 1,
                    None => record.revision = 0,
                }
                appended.push(record.clone());
                history.push(record);
            }
        }

        debug!("📚 Ledger appended {} revisions", appended.len());
        appended
    }

    pub fn write_gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.write_gate)
    }

    /// Drop revisions that were appended but never persisted
    pub fn forget(&self, appended: &[PitRecord]) {
        let mut revisions = self.revisions.write().unwrap_or_else(PoisonError::into_inner);
        for record in appended {
            let key = record.key();
            if let Some(history) = revisions.get_mut(&key) {
                history.retain(|r| r.revision != record.revision);
                if history.is_empty() {
                    revisions.remove(&key);
                }
            }
        }
    }

    /// Authoritative record with the greatest announce date on or before `as_of_date`
    pub fn as_of(&self, entity: &str, period_end: NaiveDate, as_of_date: NaiveDate) -> Option<PitRecord> {
        let revisions = self.revisions.read().unwrap_or_else(PoisonError::into_inner);
        revisions
            .iter()
            .filter(|(key, _)| {
                key.entity == entity && key.period_end == period_end && key.announce_date <= as_of_date
            })
            .filter_map(|(_, history)| history.last())
            .filter(|r| r.is_authoritative)
            .max_by_key(|r| r.announce_date)
            .cloned()
    }

    /// Every stored revision of one natural key, oldest first
    pub fn history(&self, key: &PitKey) -> Vec<PitRecord> {
        let revisions = self.revisions.read().unwrap_or_else(PoisonError::into_inner);
        revisions.get(key).cloned().unwrap_or_default()
    }

    /// Latest revision of every key
    pub fn current(&self) -> Vec<PitRecord> {
        let revisions = self.revisions.read().unwrap_or_else(PoisonError::into_inner);
        revisions.values().filter_map(|h| h.last().cloned()).collect()
    }

    pub fn len(&self) -> usize {
        let revisions = self.revisions.read().unwrap_or_else(PoisonError::into_inner);
        revisions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage row for one PIT revision. `date` carries the announce date so the
/// table's watermark tracks what has been announced.
pub fn to_row(record: &PitRecord) -> Result<Row, GatewayError> {
    let mut row = Row::new(record.entity.clone(), record.announce_date)
        .with_value("period_end", record.period_end.format("%Y-%m-%d").to_string())
        .with_value("announce_date", record.announce_date.format("%Y-%m-%d").to_string())
        .with_value("source", record.source.clone())
        .with_value("revision", record.revision)
        .with_value("is_authoritative", record.is_authoritative)
        .with_value("data_quality", serde_json::to_value(record.data_quality)?);

    for (name, value) in &record.fields {
        row = row.with_value(name.clone(), value.map(Value::from).unwrap_or(Value::Null));
    }
    Ok(row)
}

const RESERVED_COLUMNS: [&str; 6] = [
    "period_end",
    "announce_date",
    "source",
    "revision",
    "is_authoritative",
    "data_quality",
];

pub fn from_row(row: &Row) -> Result<PitRecord, GatewayError> {
    let text = |name: &str| -> Result<&str, GatewayError> {
        row.values
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Corrupt(format!("PIT row is missing '{}'", name)))
    };
    let date = |name: &str| -> Result<NaiveDate, GatewayError> {
        let raw = text(name)?;
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|e| GatewayError::Corrupt(format!("bad {} '{}': {}", name, raw, e)))
    };

    let revision = row
        .values
        .get("revision")
        .and_then(Value::as_u64)
        .and_then(|r| u32::try_from(r).ok())
        .ok_or_else(|| GatewayError::Corrupt("PIT row has no valid revision".into()))?;
    let data_quality: DataQuality = row
        .values
        .get("data_quality")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or(DataQuality::Partial);

    let fields = row
        .values
        .iter()
        .filter(|(name, _)| !RESERVED_COLUMNS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.as_f64()))
        .collect();

    Ok(PitRecord {
        entity: row.entity.clone(),
        period_end: date("period_end")?,
        announce_date: date("announce_date")?,
        source: text("source")?.to_string(),
        fields,
        data_quality,
        is_authoritative: row
            .values
            .get("is_authoritative")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        revision,
    })
}

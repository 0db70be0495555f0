//! Point-in-time reconciliation of multi-source records.
//!
//! Authority is decided per announce-date snapshot: for each date `d` on which
//! something was announced for an `(entity, period_end)`, the resolver runs over
//! everything announced on or before `d`. The record announced on `d` is
//! authoritative only if it wins that snapshot. Querying "as of" any date then
//! reduces to taking the latest authoritative record announced on or before it.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::models::{DataQuality, PitKey, PitRecord, RawRecord};
use crate::reconcile::priority::{SourcePriority, SourcePriorityResolver};

/// Output of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Ordered by entity, period, announce date, source
    pub records: Vec<PitRecord>,
    pub warnings: Vec<String>,
}

impl Reconciliation {
    pub fn authoritative(&self) -> impl Iterator<Item = &PitRecord> {
        self.records.iter().filter(|r| r.is_authoritative)
    }
}

pub struct PitReconciler {
    resolver: SourcePriorityResolver,
    field_set: Vec<String>,
}

impl PitReconciler {
    pub fn new(priority: SourcePriority, field_set: Vec<String>) -> Self {
        Self {
            resolver: SourcePriorityResolver::new(priority),
            field_set,
        }
    }

    pub fn resolver(&self) -> &SourcePriorityResolver {
        &self.resolver
    }

    pub fn domain(&self) -> &str {
        &self.resolver.priority().domain
    }

    /// Project a raw record onto the domain's field set. Missing fields become
    /// explicit nulls; fields outside the set are dropped. An empty field set
    /// keeps the record's own fields.
    pub fn normalize(&self, raw: &RawRecord) -> PitRecord {
        let fields: BTreeMap<String, Option<f64>> = if self.field_set.is_empty() {
            raw.fields.clone()
        } else {
            self.field_set
                .iter()
                .map(|name| (name.clone(), raw.fields.get(name).copied().flatten()))
                .collect()
        };

        let data_quality = if self.resolver.is_ranked(&raw.source) {
            quality_of(&fields)
        } else {
            DataQuality::Unranked
        };

        PitRecord {
            entity: raw.entity.clone(),
            period_end: raw.period_end,
            announce_date: raw.announce_date,
            source: raw.source.clone(),
            fields,
            data_quality,
            is_authoritative: false,
            revision: 0,
        }
    }

    /// Merge per-source raw records into PIT rows with authority marked.
    ///
    /// The map key is the source name and overrides whatever the record says.
    pub fn reconcile(&self, raw_by_source: &BTreeMap<String, Vec<RawRecord>>) -> Reconciliation {
        let mut warnings = Vec::new();
        let mut unranked: BTreeSet<&str> = BTreeSet::new();
        let mut by_key: BTreeMap<PitKey, PitRecord> = BTreeMap::new();

        for (source, records) in raw_by_source {
            if !self.resolver.is_ranked(source) && !records.is_empty() {
                unranked.insert(source.as_str());
            }
            for raw in records {
                let mut normalized = self.normalize(raw);
                if normalized.source != *source {
                    normalized.source = source.clone();
                    if !self.resolver.is_ranked(source) {
                        normalized.data_quality = DataQuality::Unranked;
                    } else if normalized.data_quality == DataQuality::Unranked {
                        normalized.data_quality = quality_of(&normalized.fields);
                    }
                }
                self.insert_deduplicated(&mut by_key, normalized);
            }
        }

        for source in unranked {
            let message = format!(
                "source '{}' is not ranked for domain '{}'; its records are kept but never authoritative",
                source,
                self.domain()
            );
            warn!("⚠️ {}", message);
            warnings.push(message);
        }

        let mut groups: BTreeMap<(String, NaiveDate), Vec<PitRecord>> = BTreeMap::new();
        for (key, record) in by_key {
            groups
                .entry((key.entity, key.period_end))
                .or_default()
                .push(record);
        }

        let mut records = Vec::new();
        for (_, mut group) in groups {
            self.mark_authority(&mut group);
            records.extend(group);
        }

        debug!(
            "🧮 Reconciled {} records for domain {} ({} authoritative)",
            records.len(),
            self.domain(),
            records.iter().filter(|r| r.is_authoritative).count()
        );

        Reconciliation { records, warnings }
    }

    /// Recompute authority flags for one `(entity, period_end)` group in place.
    /// Leaves the group ordered by announce date, then source.
    pub fn mark_authority(&self, group: &mut [PitRecord]) {
        group.sort_by(|a, b| {
            a.announce_date
                .cmp(&b.announce_date)
                .then_with(|| a.source.cmp(&b.source))
        });

        for record in group.iter_mut() {
            record.is_authoritative = false;
        }

        let announce_dates: BTreeSet<NaiveDate> = group.iter().map(|r| r.announce_date).collect();

        for snapshot in announce_dates {
            let visible: Vec<&PitRecord> = group
                .iter()
                .take_while(|r| r.announce_date <= snapshot)
                .collect();

            if let Some(winner) = self.resolver.pick_winner(&visible) {
                // Records are sorted by announce date, so visible indices match group indices
                if group[winner].announce_date == snapshot {
                    group[winner].is_authoritative = true;
                }
            }
        }
    }

    /// Keep one record per natural key, choosing deterministically on collision
    fn insert_deduplicated(&self, by_key: &mut BTreeMap<PitKey, PitRecord>, record: PitRecord) {
        let key = record.key();
        match by_key.get(&key) {
            Some(existing) => {
                let existing_filled = existing.fields.values().filter(|v| v.is_some()).count();
                let incoming_filled = record.fields.values().filter(|v| v.is_some()).count();
                let replace = incoming_filled > existing_filled
                    || (incoming_filled == existing_filled
                        && self.resolver.compare(&record, existing).is_lt());
                if replace {
                    by_key.insert(key, record);
                }
            }
            None => {
                by_key.insert(key, record);
            }
        }
    }
}

fn quality_of(fields: &BTreeMap<String, Option<f64>>) -> DataQuality {
    if fields.values().any(Option::is_none) {
        DataQuality::Partial
    } else {
        DataQuality::Complete
    }
}

/// The authoritative record with the greatest `announce_date <= as_of_date`.
///
/// Returns `None` when nothing had been announced by `as_of_date`, never a newer
/// record.
pub fn as_of<'a>(
    records: &'a [PitRecord],
    entity: &str,
    period_end: NaiveDate,
    as_of_date: NaiveDate,
) -> Option<&'a PitRecord> {
    records
        .iter()
        .filter(|r| {
            r.is_authoritative
                && r.entity == entity
                && r.period_end == period_end
                && r.announce_date <= as_of_date
        })
        .max_by_key(|r| r.announce_date)
}

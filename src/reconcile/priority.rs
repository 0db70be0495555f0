use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::warn;

use crate::models::{PitRecord, RawRecord};

/// Static source ranking for one data domain, highest priority first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePriority {
    pub domain: String,
    pub order: Vec<String>,
}

impl SourcePriority {
    pub fn new<I, S>(domain: impl Into<String>, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain: domain.into(),
            order: order.into_iter().map(Into::into).collect(),
        }
    }

    /// Index in the order; lower is more authoritative
    pub fn rank(&self, source: &str) -> Option<usize> {
        self.order.iter().position(|s| s == source)
    }
}

/// Anything the resolver can rank
pub trait Ranked {
    fn source(&self) -> &str;
    fn announce_date(&self) -> NaiveDate;
    fn fields(&self) -> &BTreeMap<String, Option<f64>>;
}

impl Ranked for RawRecord {
    fn source(&self) -> &str {
        &self.source
    }
    fn announce_date(&self) -> NaiveDate {
        self.announce_date
    }
    fn fields(&self) -> &BTreeMap<String, Option<f64>> {
        &self.fields
    }
}

impl Ranked for PitRecord {
    fn source(&self) -> &str {
        &self.source
    }
    fn announce_date(&self) -> NaiveDate {
        self.announce_date
    }
    fn fields(&self) -> &BTreeMap<String, Option<f64>> {
        &self.fields
    }
}

/// Winner and retained losers for one `(entity, period_end)` group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupResolution {
    pub entity: String,
    pub period_end: NaiveDate,
    pub winner: RawRecord,
    pub losers: Vec<RawRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Ordered by entity, then period
    pub groups: Vec<GroupResolution>,
    /// Candidates whose source is not in the priority order
    pub excluded: Vec<RawRecord>,
    pub warnings: Vec<String>,
}

/// Picks the authoritative source per `(entity, period_end)`
#[derive(Debug, Clone)]
pub struct SourcePriorityResolver {
    priority: SourcePriority,
}

impl SourcePriorityResolver {
    pub fn new(priority: SourcePriority) -> Self {
        Self { priority }
    }

    pub fn priority(&self) -> &SourcePriority {
        &self.priority
    }

    pub fn is_ranked(&self, source: &str) -> bool {
        self.priority.rank(source).is_some()
    }

    pub fn resolve(&self, candidates: &[RawRecord]) -> Resolution {
        let mut resolution = Resolution::default();
        let mut groups: BTreeMap<(String, NaiveDate), Vec<&RawRecord>> = BTreeMap::new();

        for candidate in candidates {
            if !self.is_ranked(&candidate.source) {
                let message = format!(
                    "source '{}' is not ranked for domain '{}'; excluded {} {}",
                    candidate.source, self.priority.domain, candidate.entity, candidate.period_end
                );
                warn!("⚠️ {}", message);
                resolution.warnings.push(message);
                resolution.excluded.push(candidate.clone());
                continue;
            }
            groups
                .entry((candidate.entity.clone(), candidate.period_end))
                .or_default()
                .push(candidate);
        }

        for ((entity, period_end), mut members) in groups {
            members.sort_by(|a, b| self.compare(*a, *b));
            let mut members = members.into_iter().cloned();
            if let Some(winner) = members.next() {
                resolution.groups.push(GroupResolution {
                    entity,
                    period_end,
                    winner,
                    losers: members.collect(),
                });
            }
        }

        resolution
    }

    /// Index of the winning candidate, ignoring unranked sources
    pub fn pick_winner<T: Ranked>(&self, candidates: &[&T]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| self.is_ranked(c.source()))
            .min_by(|(_, a), (_, b)| self.compare(**a, **b))
            .map(|(i, _)| i)
    }

    /// Best candidate sorts first
    pub fn compare<T: Ranked>(&self, a: &T, b: &T) -> Ordering {
        let rank_a = self.priority.rank(a.source()).unwrap_or(usize::MAX);
        let rank_b = self.priority.rank(b.source()).unwrap_or(usize::MAX);

        rank_a
            .cmp(&rank_b)
            .then_with(|| b.announce_date().cmp(&a.announce_date()))
            .then_with(|| a.source().cmp(b.source()))
            .then_with(|| compare_fields(a.fields(), b.fields()))
    }
}

/// Total order over field maps so identical candidate sets always agree
fn compare_fields(
    a: &BTreeMap<String, Option<f64>>,
    b: &BTreeMap<String, Option<f64>>,
) -> Ordering {
    let mut left = a.iter();
    let mut right = b.iter();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let ordering = ka.cmp(kb).then_with(|| match (va, vb) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (Some(x), Some(y)) => x.total_cmp(y),
                });
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

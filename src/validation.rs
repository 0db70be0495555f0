//! Structural checks applied to upstream records before they are transformed.

use tracing::warn;

use crate::models::RawRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowValidator {
    /// Fields that must appear on every record (value may be null)
    pub required_columns: Vec<String>,
    /// Fields that must appear and carry a value
    pub non_null_columns: Vec<String>,
}

/// Records that passed and how many were dropped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validated {
    pub rows: Vec<RawRecord>,
    pub rejected: usize,
}

impl RowValidator {
    pub fn new(required_columns: Vec<String>, non_null_columns: Vec<String>) -> Self {
        Self {
            required_columns,
            non_null_columns,
        }
    }

    /// Why a record is rejected, or `None` if it is acceptable
    pub fn check(&self, record: &RawRecord) -> Option<String> {
        if record.entity.trim().is_empty() {
            return Some("empty entity".to_string());
        }
        if record.source.trim().is_empty() {
            return Some("empty source".to_string());
        }
        if let Some(missing) = self
            .required_columns
            .iter()
            .find(|c| !record.fields.contains_key(c.as_str()))
        {
            return Some(format!("missing column '{}'", missing));
        }
        if let Some(null) = self
            .non_null_columns
            .iter()
            .find(|c| !matches!(record.fields.get(c.as_str()), Some(Some(_))))
        {
            return Some(format!("null value in '{}'", null));
        }
        None
    }

    pub fn validate(&self, records: Vec<RawRecord>) -> Validated {
        let mut validated = Validated::default();
        for record in records {
            match self.check(&record) {
                None => validated.rows.push(record),
                Some(reason) => {
                    warn!(
                        "⚠️ Rejected {} {} from {}: {}",
                        record.entity, record.period_end, record.source, reason
                    );
                    validated.rejected += 1;
                }
            }
        }
        validated
    }
}

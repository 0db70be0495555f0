//! File-drop upstream: one CSV per `(source, api)` under a data directory.
//!
//! Layout is `<data_dir>/<source>/<api>.csv`. Recognised columns are `entity`,
//! `period_end`, `announce_date`, `date` and `source`; every other column is a
//! numeric field where an empty cell means null. Files with only a `date`
//! column use it as both period end and announce date.

use async_trait::async_trait;
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{BatchParams, UpstreamSource};
use crate::error::UpstreamError;
use crate::models::RawRecord;

const KEY_COLUMNS: [&str; 5] = ["entity", "period_end", "announce_date", "date", "source"];

#[derive(Debug, Clone)]
pub struct CsvSource {
    name: String,
    data_dir: PathBuf,
    delimiter: u8,
}

impl CsvSource {
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn file_path(&self, api_name: &str) -> PathBuf {
        self.data_dir.join(&self.name).join(format!("{}.csv", api_name))
    }
}

#[async_trait]
impl UpstreamSource for CsvSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_batch(
        &self,
        api_name: &str,
        params: &BatchParams,
    ) -> Result<Vec<RawRecord>, UpstreamError> {
        let path = self.file_path(api_name);
        let source = self.name.clone();
        let delimiter = self.delimiter;
        let batch_number = params.batch_number;
        let params = params.clone();

        let records = tokio::task::spawn_blocking(move || {
            read_records(&path, &source, delimiter, &params)
        })
        .await
        .map_err(|e| UpstreamError::Transient(format!("CSV reader task failed: {}", e)))??;

        debug!(
            "📥 {}:{} returned {} records for batch {}",
            self.name,
            api_name,
            records.len(),
            batch_number
        );
        Ok(records)
    }
}

fn read_records(
    path: &Path,
    source: &str,
    delimiter: u8,
    params: &BatchParams,
) -> Result<Vec<RawRecord>, UpstreamError> {
    if !path.exists() {
        warn!("⚠️ No upstream file at {}, treating as empty", path.display());
        return Ok(Vec::new());
    }

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| UpstreamError::Transient(format!("cannot open {}: {}", path.display(), e)))?;

    let headers = reader
        .headers()
        .map_err(|e| UpstreamError::Malformed(format!("{}: bad header: {}", path.display(), e)))?
        .clone();
    let layout = Layout::from_headers(&headers)
        .ok_or_else(|| UpstreamError::Malformed(format!("{}: missing 'entity' column", path.display())))?;

    let mut records = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let row = result.map_err(|e| {
            UpstreamError::Malformed(format!("{}: row {}: {}", path.display(), line + 1, e))
        })?;
        let record = layout
            .parse(&headers, &row, source)
            .map_err(|e| UpstreamError::Malformed(format!("{}: row {}: {}", path.display(), line + 1, e)))?;

        let wanted_entity = params.entities.is_empty() || params.entities.contains(&record.entity);
        let in_window =
            record.announce_date >= params.start_date && record.announce_date <= params.end_date;
        if wanted_entity && in_window {
            records.push(record);
        }
    }

    Ok(records)
}

/// Column positions resolved once per file
struct Layout {
    entity: usize,
    period_end: Option<usize>,
    announce_date: Option<usize>,
    date: Option<usize>,
    source: Option<usize>,
    fields: Vec<usize>,
}

impl Layout {
    fn from_headers(headers: &StringRecord) -> Option<Self> {
        let position = |name: &str| headers.iter().position(|h| h == name);
        Some(Self {
            entity: position("entity")?,
            period_end: position("period_end"),
            announce_date: position("announce_date"),
            date: position("date"),
            source: position("source"),
            fields: headers
                .iter()
                .enumerate()
                .filter(|(_, h)| !KEY_COLUMNS.contains(h))
                .map(|(i, _)| i)
                .collect(),
        })
    }

    fn parse(&self, headers: &StringRecord, row: &StringRecord, source: &str) -> Result<RawRecord, String> {
        let cell = |index: usize| row.get(index).unwrap_or("");
        let date_at = |index: Option<usize>| -> Result<Option<NaiveDate>, String> {
            match index.map(cell) {
                None | Some("") => Ok(None),
                Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map(Some)
                    .map_err(|e| format!("invalid date '{}': {}", raw, e)),
            }
        };

        let date = date_at(self.date)?;
        let period_end = date_at(self.period_end)?
            .or(date)
            .ok_or_else(|| "missing period_end".to_string())?;
        let announce_date = date_at(self.announce_date)?.or(date).unwrap_or(period_end);

        let record_source = match self.source.map(cell) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => source.to_string(),
        };

        let mut fields = BTreeMap::new();
        for &index in &self.fields {
            let name = headers.get(index).unwrap_or_default().to_string();
            let raw = cell(index);
            let value = if raw.is_empty() {
                None
            } else {
                Some(
                    raw.parse::<f64>()
                        .map_err(|_| format!("column '{}' is not numeric: '{}'", name, raw))?,
                )
            };
            fields.insert(name, value);
        }

        Ok(RawRecord {
            entity: cell(self.entity).to_string(),
            period_end,
            announce_date,
            source: record_source,
            fields,
        })
    }
}

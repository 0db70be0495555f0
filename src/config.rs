//! TOML configuration with environment overrides.

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::executor::RetryPolicy;
use crate::models::{EntityKeys, JobSpec};
use crate::reconcile::{PitReconciler, SourcePriority};
use crate::tools::batching::BatchPolicy;
use crate::tools::range_planner::RangePlanner;
use crate::validation::RowValidator;

pub const DEFAULT_CONFIG_PATH: &str = "pit-sync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {var} has invalid value '{value}'")]
    BadOverride { var: String, value: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub max_concurrency: usize,
    pub lookback_days: u32,
    pub default_epoch: NaiveDate,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("pit_sync.db"),
            data_dir: PathBuf::from("data"),
            max_concurrency: 4,
            lookback_days: 5,
            default_epoch: RangePlanner::default().epoch_start(""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub rate_limit_multiplier: f64,
    pub timeout_secs: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            backoff_base_ms: policy.backoff_base.as_millis() as u64,
            backoff_max_ms: policy.backoff_max.as_millis() as u64,
            rate_limit_multiplier: policy.rate_limit_multiplier,
            timeout_secs: policy.timeout.as_secs(),
            jitter: policy.jitter,
        }
    }
}

/// Source ranking and field set of one reconciled data domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    /// Highest priority first
    pub priority: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl DomainConfig {
    pub fn reconciler(&self) -> PitReconciler {
        PitReconciler::new(
            SourcePriority::new(self.name.clone(), self.priority.iter().cloned()),
            self.fields.clone(),
        )
    }
}

fn default_entity_chunk() -> usize {
    50
}

fn default_max_in_flight() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub source: String,
    pub api: String,
    pub table: String,
    pub entity_type: String,
    #[serde(default)]
    pub entities: EntityKeys,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub batch: BatchPolicy,
    #[serde(default = "default_entity_chunk")]
    pub entity_chunk: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Reconcile through this domain instead of writing rows as delivered
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub non_null_fields: Vec<String>,
    /// Overrides `settings.lookback_days`
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub best_effort: bool,
}

impl JobConfig {
    pub fn spec(&self) -> JobSpec {
        self.dependencies.iter().fold(
            JobSpec::new(self.name.clone(), self.source.clone()).with_entities(self.entities.clone()),
            |spec, dependency| spec.depends_on(dependency.clone()),
        )
    }

    pub fn validator(&self) -> RowValidator {
        RowValidator::new(self.required_fields.clone(), self.non_null_fields.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub settings: Settings,
    pub retry: RetrySettings,
    /// First date data can exist, per entity type
    pub epochs: BTreeMap<String, NaiveDate>,
    pub domains: Vec<DomainConfig>,
    pub jobs: Vec<JobConfig>,
}

impl Config {
    /// Read the TOML file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        config
            .apply_env_overrides()
            .context("cannot apply environment overrides")?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply `PIT_SYNC_*` overrides read through `lookup`
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("PIT_SYNC_DATABASE_PATH") {
            self.settings.database_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("PIT_SYNC_DATA_DIR") {
            self.settings.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("PIT_SYNC_MAX_CONCURRENCY") {
            self.settings.max_concurrency = parse_override("PIT_SYNC_MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("PIT_SYNC_LOOKBACK_DAYS") {
            self.settings.lookback_days = parse_override("PIT_SYNC_LOOKBACK_DAYS", &value)?;
        }
        Ok(())
    }

    /// Every problem in the configuration, not just the first
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.settings.max_concurrency == 0 {
            problems.push("settings.max_concurrency must be at least 1".to_string());
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            problems.push("retry.backoff_base_ms exceeds retry.backoff_max_ms".to_string());
        }
        if self.retry.timeout_secs == 0 {
            problems.push("retry.timeout_secs must be positive".to_string());
        }
        if !self.retry.rate_limit_multiplier.is_finite() || self.retry.rate_limit_multiplier < 1.0 {
            problems.push("retry.rate_limit_multiplier must be a finite number of at least 1.0".to_string());
        }

        let mut domain_names = BTreeSet::new();
        for domain in &self.domains {
            if !domain_names.insert(domain.name.as_str()) {
                problems.push(format!("domain '{}' is defined twice", domain.name));
            }
            if domain.priority.is_empty() {
                problems.push(format!("domain '{}' has an empty priority order", domain.name));
            }
            let unique: BTreeSet<&String> = domain.priority.iter().collect();
            if unique.len() != domain.priority.len() {
                problems.push(format!("domain '{}' lists a source twice", domain.name));
            }
        }

        let job_names: BTreeSet<&str> = self.jobs.iter().map(|j| j.name.as_str()).collect();
        let mut seen = BTreeSet::new();
        let mut table_domains: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                problems.push("a job has an empty name".to_string());
            }
            if !seen.insert(job.name.as_str()) {
                problems.push(format!("job '{}' is defined twice", job.name));
            }
            for dependency in &job.dependencies {
                if !job_names.contains(dependency.as_str()) {
                    problems.push(format!("job '{}' depends on unknown job '{}'", job.name, dependency));
                }
            }
            if let Some(domain) = &job.domain {
                if !domain_names.contains(domain.as_str()) {
                    problems.push(format!("job '{}' uses unknown domain '{}'", job.name, domain));
                }
            }
            let previous = table_domains.insert(job.table.as_str(), job.domain.as_deref());
            if matches!(previous, Some(other) if other != job.domain.as_deref()) {
                problems.push(format!("table '{}' is written with different domains", job.table));
            }
            if let EntityKeys::List(entities) = &job.entities {
                if entities.is_empty() {
                    problems.push(format!("job '{}' has an empty entity list", job.name));
                }
            }
            if let BatchPolicy::FixedDays { days: 0 } = job.batch {
                problems.push(format!("job '{}' uses fixed_days batches of 0 days", job.name));
            }
            if job.max_in_flight == 0 {
                problems.push(format!("job '{}' has max_in_flight 0", job.name));
            }
            if job.requests_per_minute == Some(0) {
                problems.push(format!("job '{}' has requests_per_minute 0", job.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            backoff_base: Duration::from_millis(self.retry.backoff_base_ms),
            backoff_max: Duration::from_millis(self.retry.backoff_max_ms),
            rate_limit_multiplier: self.retry.rate_limit_multiplier,
            timeout: Duration::from_secs(self.retry.timeout_secs),
            jitter: self.retry.jitter,
        }
    }

    pub fn range_planner(&self) -> RangePlanner {
        self.epochs
            .iter()
            .fold(RangePlanner::new(self.settings.default_epoch), |planner, (entity_type, epoch)| {
                planner.with_epoch(entity_type.clone(), *epoch)
            })
    }

    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

fn parse_override<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadOverride {
        var: var.to_string(),
        value: value.to_string(),
    })
}

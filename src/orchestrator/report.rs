use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

use crate::models::{ExecutionResult, JobStatus};

/// A job that did not succeed, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIssue {
    pub job_name: String,
    pub reason: String,
}

/// Aggregate report of one orchestrator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_rows: u64,
    pub total_duration_ms: i64,
    pub average_duration_ms: Option<i64>,
    pub failed_jobs: Vec<JobIssue>,
    pub skipped_jobs: Vec<JobIssue>,
    /// Successful jobs that reported a partial fetch
    pub partial_jobs: Vec<String>,
}

impl ExecutionSummary {
    pub fn from_results(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        results: &[ExecutionResult],
    ) -> Self {
        let mut failed_jobs = Vec::new();
        let mut skipped_jobs = Vec::new();
        let mut partial_jobs = Vec::new();

        for result in results {
            let issue = || JobIssue {
                job_name: result.job_name.clone(),
                reason: result.error_message.clone().unwrap_or_default(),
            };
            match result.status {
                JobStatus::Failed => failed_jobs.push(issue()),
                JobStatus::Skipped => skipped_jobs.push(issue()),
                JobStatus::Success if result.metadata.get("partial").map(String::as_str) == Some("true") => {
                    partial_jobs.push(result.job_name.clone())
                }
                _ => {}
            }
        }

        let durations: Vec<i64> = results
            .iter()
            .filter(|r| r.status != JobStatus::Skipped)
            .filter_map(ExecutionResult::duration_ms)
            .collect();
        let total_duration_ms = (finished_at - started_at).num_milliseconds().max(0);
        let average_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() / durations.len() as i64)
        };

        Self {
            run_id,
            started_at,
            finished_at,
            total_jobs: results.len(),
            succeeded: results.iter().filter(|r| r.status == JobStatus::Success).count(),
            failed: results.iter().filter(|r| r.status == JobStatus::Failed).count(),
            skipped: results.iter().filter(|r| r.status == JobStatus::Skipped).count(),
            total_rows: results.iter().map(|r| r.rows_processed).sum(),
            total_duration_ms,
            average_duration_ms,
            failed_jobs,
            skipped_jobs,
            partial_jobs,
        }
    }

    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Success => self.succeeded,
            JobStatus::Failed => self.failed,
            JobStatus::Skipped => self.skipped,
            JobStatus::Pending | JobStatus::Running => {
                self.total_jobs - self.succeeded - self.failed - self.skipped
            }
        }
    }

    /// 0 only when every job that was not skipped succeeded
    pub fn exit_code(&self, fail_on_skipped: bool) -> i32 {
        let unfinished = self.total_jobs - self.succeeded - self.failed - self.skipped;
        if self.failed > 0 || unfinished > 0 || (fail_on_skipped && self.skipped > 0) {
            1
        } else {
            0
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable report for the terminal
    pub fn render(&self) -> String {
        let rule = "━".repeat(60);
        let mut out = String::new();

        let _ = writeln!(out, "📊 RUN SUMMARY ({})", self.run_id);
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(
            out,
            "✅ Success: {}  ❌ Failed: {}  ⏭️  Skipped: {}  (total {})",
            self.count(JobStatus::Success),
            self.count(JobStatus::Failed),
            self.count(JobStatus::Skipped),
            self.total_jobs
        );
        let _ = writeln!(out, "📈 Rows processed: {}", self.total_rows);
        let _ = writeln!(
            out,
            "⏱️  Duration: {} ms (average per job: {})",
            self.total_duration_ms,
            self.average_duration_ms
                .map(|ms| format!("{} ms", ms))
                .unwrap_or_else(|| "n/a".to_string())
        );

        if !self.failed_jobs.is_empty() {
            let _ = writeln!(out, "\n❌ FAILED JOBS:");
            for issue in &self.failed_jobs {
                let _ = writeln!(out, "   • {}: {}", issue.job_name, issue.reason);
            }
        }
        if !self.skipped_jobs.is_empty() {
            let _ = writeln!(out, "\n⏭️  SKIPPED JOBS:");
            for issue in &self.skipped_jobs {
                let _ = writeln!(out, "   • {}: {}", issue.job_name, issue.reason);
            }
        }
        if !self.partial_jobs.is_empty() {
            let _ = writeln!(out, "\n⚠️  PARTIAL: {}", self.partial_jobs.join(", "));
        }
        let _ = write!(out, "{}", rule);
        out
    }
}

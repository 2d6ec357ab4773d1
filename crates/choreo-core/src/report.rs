//! Run report: what happened to every job of one scenario run.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{JobId, JobState, RunId};

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub id: JobId,
    pub name: String,
    pub state: JobState,

    /// `None` for jobs that never ran (skipped).
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Flow errors with their cause chains. The first one is the headline.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Hard predecessors that did not succeed (only for `Skipped`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_because: Vec<String>,
}

impl JobReport {
    pub fn succeeded(
        id: JobId,
        name: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            state: JobState::Succeeded,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            errors: Vec::new(),
            skipped_because: Vec::new(),
        }
    }

    pub fn failed(
        id: JobId,
        name: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        errors: Vec<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            state: JobState::Failed,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            errors,
            skipped_because: Vec::new(),
        }
    }

    pub fn skipped(id: JobId, name: impl Into<String>, because: Vec<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: JobState::Skipped,
            started_at: None,
            finished_at: None,
            errors: Vec::new(),
            skipped_because: because,
        }
    }

    /// Headline error of a failed job.
    pub fn error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    /// Wall time between start and finish.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        (end - start).to_std().ok()
    }
}

/// Aggregate counts per terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Report of one scenario run. Jobs are listed in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<JobState> {
        self.job(name).map(|j| j.state)
    }

    /// `(name, state)` pairs in declaration order. Stable across reruns of a
    /// deterministic scenario, unlike ids and timestamps.
    pub fn outcomes(&self) -> Vec<(String, JobState)> {
        self.jobs.iter().map(|j| (j.name.clone(), j.state)).collect()
    }

    pub fn counts(&self) -> RunCounts {
        let mut counts = RunCounts {
            total: self.jobs.len(),
            ..RunCounts::default()
        };
        for job in &self.jobs {
            match job.state {
                JobState::Succeeded => counts.succeeded += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Skipped => counts.skipped += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| j.state == JobState::Failed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| j.state == JobState::Skipped)
    }

    /// No job failed. Skips alone do not fail a run.
    pub fn is_success(&self) -> bool {
        self.counts().failed == 0
    }

    /// Process exit status: `0` on success, `1` otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Log one line per job, then the totals.
    pub fn log_summary(&self) {
        for job in &self.jobs {
            match job.state {
                JobState::Failed => warn!(
                    job = %job.name,
                    error = job.error().unwrap_or_default(),
                    "job failed"
                ),
                JobState::Skipped => warn!(
                    job = %job.name,
                    because = %job.skipped_because.join(", "),
                    "job skipped"
                ),
                state => info!(job = %job.name, state = %state, "job finished"),
            }
        }

        let counts = self.counts();
        info!(
            scenario = %self.scenario,
            run_id = %self.run_id,
            total = counts.total,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            elapsed_ms = self.duration().as_millis() as u64,
            "scenario finished"
        );
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scenario {} ({})", self.scenario, self.run_id)?;
        for job in &self.jobs {
            write!(f, "  {:<10} {}", job.state, job.name)?;
            if let Some(error) = job.error() {
                write!(f, ": {error}")?;
                if job.errors.len() > 1 {
                    write!(f, " (+{} more)", job.errors.len() - 1)?;
                }
            }
            if !job.skipped_because.is_empty() {
                write!(f, " (requires {})", job.skipped_because.join(", "))?;
            }
            writeln!(f)?;
        }
        let counts = self.counts();
        write!(
            f,
            "{} jobs: {} succeeded, {} failed, {} skipped",
            counts.total, counts.succeeded, counts.failed, counts.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn report(jobs: Vec<JobReport>) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: RunId::generate(),
            scenario: "content".into(),
            started_at: now,
            finished_at: now + TimeDelta::milliseconds(250),
            jobs,
        }
    }

    fn ok(name: &str) -> JobReport {
        let now = Utc::now();
        JobReport::succeeded(JobId::generate(), name, now, now + TimeDelta::milliseconds(40))
    }

    fn failed(name: &str) -> JobReport {
        let now = Utc::now();
        JobReport::failed(
            JobId::generate(),
            name,
            now,
            now,
            vec!["create-video: query node lagging".into(), "second".into()],
        )
    }

    #[test]
    fn counts_and_exit_code() {
        let run = report(vec![
            ok("members"),
            failed("videos"),
            JobReport::skipped(JobId::generate(), "comments", vec!["videos".into()]),
        ]);

        assert_eq!(
            run.counts(),
            RunCounts {
                total: 3,
                succeeded: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert!(!run.is_success());
        assert_eq!(run.exit_code(), 1);
        assert_eq!(run.failed().count(), 1);
        assert_eq!(run.skipped().next().map(|j| j.name.as_str()), Some("comments"));
    }

    #[test]
    fn skips_alone_are_success() {
        let run = report(vec![
            ok("members"),
            JobReport::skipped(JobId::generate(), "comments", vec!["videos".into()]),
        ]);
        assert!(run.is_success());
        assert_eq!(run.exit_code(), 0);
    }

    #[test]
    fn headline_error_and_duration() {
        let job = failed("videos");
        assert_eq!(job.error(), Some("create-video: query node lagging"));
        assert_eq!(ok("members").duration(), Some(Duration::from_millis(40)));
        assert_eq!(
            JobReport::skipped(JobId::generate(), "x", vec![]).duration(),
            None
        );
    }

    #[test]
    fn json_keeps_declaration_order() {
        let run = report(vec![ok("members"), ok("channels"), failed("videos")]);
        let json = run.to_json().unwrap();

        let members = json.find("\"members\"").unwrap();
        let channels = json.find("\"channels\"").unwrap();
        let videos = json.find("\"videos\"").unwrap();
        assert!(members < channels && channels < videos);
        assert!(json.contains("\"state\": \"failed\""));

        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.outcomes(), run.outcomes());
    }

    #[test]
    fn display_lists_every_job() {
        let run = report(vec![
            ok("members"),
            failed("videos"),
            JobReport::skipped(JobId::generate(), "comments", vec!["videos".into()]),
        ]);
        let text = run.to_string();

        assert!(text.contains("members"));
        assert!(text.contains("query node lagging (+1 more)"));
        assert!(text.contains("(requires videos)"));
        assert!(text.ends_with("3 jobs: 1 succeeded, 1 failed, 1 skipped"));
    }
}

//! `JobQueue` trait: the single async interface for job storage and leasing.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::{Job, JobSpec, JobStatus, StatusUpdate};

/// Filters for `list_jobs`. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub name: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.name.as_deref().is_none_or(|n| n == job.name.as_str())
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        self.total += count;
        match status {
            JobStatus::Waiting => self.waiting += count,
            JobStatus::Delayed => self.delayed += count,
            JobStatus::Active => self.active += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Lifecycle events broadcast to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Added {
        id: Uuid,
        name: String,
    },
    Leased {
        id: Uuid,
        agent_id: String,
        attempt: u32,
    },
    StatusChanged {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    Removed {
        id: Uuid,
    },
}

/// Queue contract. Implementations own all job mutation.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Validate and persist a new job as Waiting (or Delayed when it has a delay).
    async fn add_job(&self, spec: JobSpec) -> Result<Job, JobError>;

    /// Atomically lease one eligible job to `agent_id`.
    ///
    /// Returns `Ok(None)` when nothing is eligible. Concurrent callers never
    /// receive the same job until it is updated or its lease expires.
    async fn get_next_job(&self, agent_id: &str) -> Result<Option<Job>, JobError>;

    /// Apply a legal status transition and return the updated job.
    async fn update_job_status(&self, id: Uuid, update: StatusUpdate) -> Result<Job, JobError>;

    /// Look up a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, JobError>;

    /// Delete a job. Active jobs are only removed when `force` is set.
    async fn remove_job(&self, id: Uuid, force: bool) -> Result<Job, JobError>;

    /// Jobs matching `filter`, in insertion order.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    /// Push out the lease deadline for a job `agent_id` currently holds.
    async fn extend_lease(&self, id: Uuid, agent_id: &str, by: Duration) -> Result<Job, JobError>;

    /// Counts per status.
    async fn stats(&self) -> Result<JobStats, JobError>;

    /// Subscribe to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn filter_matches_status_and_name() {
        let job = Job::from_spec(JobSpec::new("HelloWorld", json!({})), Utc::now()).unwrap();

        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::default().with_status(JobStatus::Waiting).matches(&job));
        assert!(!JobFilter::default().with_status(JobStatus::Active).matches(&job));
        assert!(JobFilter::default().with_name("HelloWorld").matches(&job));
        assert!(!JobFilter::default().with_name("Other").matches(&job));
    }

    #[test]
    fn stats_record_counts() {
        let mut stats = JobStats::default();
        stats.record(JobStatus::Waiting, 2);
        stats.record(JobStatus::Failed, 1);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.waiting, 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = JobEvent::Removed { id: Uuid::nil() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "removed");
    }
}

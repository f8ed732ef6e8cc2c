//! In-memory job queue with broadcast of lifecycle events.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::JobError;
use crate::jobs::{Job, JobSpec, JobStatus, StatusUpdate};
use crate::queue::traits::{JobEvent, JobFilter, JobQueue, JobStats};

/// Insertion-ordered job store guarded by a single lock.
///
/// Leasing happens entirely under the write lock, which makes it a
/// compare-and-transition: two callers can never observe the same job as
/// eligible.
pub struct InMemoryJobQueue {
    jobs: RwLock<Vec<Job>>,
    config: QueueConfig,
    tx: broadcast::Sender<JobEvent>,
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (tx, _rx) = broadcast::channel(config.event_capacity.max(1));
        Self {
            jobs: RwLock::new(Vec::new()),
            config,
            tx,
        }
    }

    /// Get the total number of jobs (all statuses).
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    fn emit(&self, event: JobEvent) {
        // Ok if no one is listening
        let _ = self.tx.send(event);
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn add_job(&self, spec: JobSpec) -> Result<Job, JobError> {
        let job = Job::from_spec(spec, Utc::now())?;

        info!(job_id = %job.id, name = %job.name, status = %job.status, "Job added");
        self.jobs.write().await.push(job.clone());

        self.emit(JobEvent::Added {
            id: job.id,
            name: job.name.to_string(),
        });
        Ok(job)
    }

    async fn get_next_job(&self, agent_id: &str) -> Result<Option<Job>, JobError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        for job in jobs.iter_mut() {
            if job.fail_if_lease_exhausted(now) {
                warn!(job_id = %job.id, "Lease expired with no attempts left, job failed");
                self.emit(JobEvent::StatusChanged {
                    id: job.id,
                    from: JobStatus::Active,
                    to: JobStatus::Failed,
                });
            }
        }

        // Highest priority first, then oldest
        let mut picked: Option<usize> = None;
        for (idx, job) in jobs.iter().enumerate() {
            if !job.is_eligible(now) {
                continue;
            }
            match picked {
                Some(best) if jobs[best].priority >= job.priority => {}
                _ => picked = Some(idx),
            }
        }

        let Some(idx) = picked else {
            debug!(agent_id, "No eligible jobs");
            return Ok(None);
        };

        let job = &mut jobs[idx];
        if job.status == JobStatus::Active {
            warn!(
                job_id = %job.id,
                previous_owner = ?job.lease_owner,
                agent_id,
                "Reassigning job with expired lease"
            );
        }
        job.lease_to(agent_id, self.config.lease_duration, now);
        let leased = job.clone();
        drop(jobs);

        info!(job_id = %leased.id, name = %leased.name, agent_id, "Job leased");
        self.emit(JobEvent::Leased {
            id: leased.id,
            agent_id: agent_id.to_string(),
            attempt: leased.attempts.current() + 1,
        });
        Ok(Some(leased))
    }

    async fn update_job_status(&self, id: Uuid, update: StatusUpdate) -> Result<Job, JobError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(JobError::NotFound { id })?;

        let from = job.status;
        job.apply_update(update, now)?;
        let updated = job.clone();
        drop(jobs);

        debug!(job_id = %id, from = %from, to = %updated.status, "Job status updated");
        self.emit(JobEvent::StatusChanged {
            id,
            from,
            to: updated.status,
        });
        Ok(updated)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(self.jobs.read().await.iter().find(|j| j.id == id).cloned())
    }

    async fn remove_job(&self, id: Uuid, force: bool) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write().await;
        let idx = jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or(JobError::NotFound { id })?;

        let job = &jobs[idx];
        if job.status == JobStatus::Active && !force {
            return Err(JobError::LeaseHeld {
                id,
                owner: job.lease_owner.clone().unwrap_or_default(),
            });
        }

        let removed = jobs.remove(idx);
        drop(jobs);

        info!(job_id = %id, status = %removed.status, force, "Job removed");
        self.emit(JobEvent::Removed { id });
        Ok(removed)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .iter()
            .filter(|j| filter.matches(j))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn extend_lease(&self, id: Uuid, agent_id: &str, by: Duration) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(JobError::NotFound { id })?;
        job.extend_lease(agent_id, by, Utc::now())?;
        debug!(job_id = %id, agent_id, "Lease extended");
        Ok(job.clone())
    }

    async fn stats(&self) -> Result<JobStats, JobError> {
        let mut stats = JobStats::default();
        for job in self.jobs.read().await.iter() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn short_lease_queue(lease: Duration) -> InMemoryJobQueue {
        InMemoryJobQueue::new(QueueConfig {
            lease_duration: lease,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn add_and_get() {
        let queue = InMemoryJobQueue::default();
        assert!(queue.is_empty().await);

        let job = queue
            .add_job(JobSpec::new("HelloWorld", json!({"name": "Ada"})))
            .await
            .unwrap();
        assert_eq!(queue.len().await, 1);

        let fetched = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Waiting);
        assert_eq!(fetched.payload["name"], "Ada");
    }

    #[tokio::test]
    async fn add_rejects_invalid_job() {
        let queue = InMemoryJobQueue::default();
        let err = queue.add_job(JobSpec::new("", json!({}))).await;
        assert!(matches!(err, Err(JobError::Validation(_))));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn next_job_on_empty_queue_is_none() {
        let queue = InMemoryJobQueue::default();
        assert!(queue.get_next_job("agent-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let queue = InMemoryJobQueue::default();
        queue.add_job(JobSpec::new("HelloWorld", json!({}))).await.unwrap();

        let leased = queue.get_next_job("agent-1").await.unwrap().unwrap();
        assert_eq!(leased.status, JobStatus::Active);
        assert_eq!(leased.lease_owner.as_deref(), Some("agent-1"));

        assert!(queue.get_next_job("agent-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn priority_then_insertion_order() {
        let queue = InMemoryJobQueue::default();
        let low = queue.add_job(JobSpec::new("a", json!({}))).await.unwrap();
        let high = queue
            .add_job(JobSpec::new("b", json!({})).with_priority(5))
            .await
            .unwrap();
        let low2 = queue.add_job(JobSpec::new("c", json!({}))).await.unwrap();

        assert_eq!(queue.get_next_job("x").await.unwrap().unwrap().id, high.id);
        assert_eq!(queue.get_next_job("x").await.unwrap().unwrap().id, low.id);
        assert_eq!(queue.get_next_job("x").await.unwrap().unwrap().id, low2.id);
    }

    #[tokio::test]
    async fn delayed_job_not_leased_early() {
        let queue = InMemoryJobQueue::default();
        let job = queue
            .add_job(JobSpec::new("HelloWorld", json!({})).with_delay(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(queue.get_next_job("agent-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reassigned() {
        let queue = short_lease_queue(Duration::from_millis(20));
        let job = queue.add_job(JobSpec::new("HelloWorld", json!({}))).await.unwrap();

        queue.get_next_job("agent-1").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let released = queue.get_next_job("agent-2").await.unwrap().unwrap();
        assert_eq!(released.id, job.id);
        assert_eq!(released.lease_owner.as_deref(), Some("agent-2"));
        assert_eq!(released.attempts.current(), 1);
    }

    #[tokio::test]
    async fn expired_lease_without_budget_fails() {
        let queue = short_lease_queue(Duration::from_millis(20));
        let job = queue
            .add_job(JobSpec::new("HelloWorld", json!({})).with_max_attempts(1))
            .await
            .unwrap();

        queue.get_next_job("agent-1").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(queue.get_next_job("agent-2").await.unwrap().is_none());
        let failed = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some(crate::jobs::LEASE_EXPIRED_ERROR));
    }

    #[tokio::test]
    async fn extend_lease_keeps_job_owned() {
        let queue = short_lease_queue(Duration::from_millis(30));
        let job = queue.add_job(JobSpec::new("HelloWorld", json!({}))).await.unwrap();
        queue.get_next_job("agent-1").await.unwrap().unwrap();

        queue
            .extend_lease(job.id, "agent-1", Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.get_next_job("agent-2").await.unwrap().is_none());

        let err = queue
            .extend_lease(job.id, "agent-2", Duration::from_secs(60))
            .await;
        assert!(matches!(err, Err(JobError::NotLeaseOwner { .. })));
    }

    #[tokio::test]
    async fn update_unknown_job_is_not_found() {
        let queue = InMemoryJobQueue::default();
        let err = queue
            .update_job_status(Uuid::new_v4(), StatusUpdate::completed(json!(null)))
            .await;
        assert!(matches!(err, Err(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn update_rejects_illegal_transition() {
        let queue = InMemoryJobQueue::default();
        let job = queue.add_job(JobSpec::new("HelloWorld", json!({}))).await.unwrap();

        let err = queue
            .update_job_status(job.id, StatusUpdate::completed(json!(1)))
            .await;
        assert!(matches!(err, Err(JobError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn remove_active_requires_force() {
        let queue = InMemoryJobQueue::default();
        let job = queue.add_job(JobSpec::new("HelloWorld", json!({}))).await.unwrap();
        queue.get_next_job("agent-1").await.unwrap().unwrap();

        let err = queue.remove_job(job.id, false).await;
        assert!(matches!(err, Err(JobError::LeaseHeld { .. })));
        assert!(queue.get_job(job.id).await.unwrap().is_some());

        let removed = queue.remove_job(job.id, true).await.unwrap();
        assert_eq!(removed.id, job.id);
        assert!(queue.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let queue = InMemoryJobQueue::default();
        let err = queue.remove_job(Uuid::new_v4(), true).await;
        assert!(matches!(err, Err(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_filters_in_insertion_order() {
        let queue = InMemoryJobQueue::default();
        let a = queue.add_job(JobSpec::new("a", json!({}))).await.unwrap();
        let b = queue.add_job(JobSpec::new("b", json!({}))).await.unwrap();
        let a2 = queue.add_job(JobSpec::new("a", json!({}))).await.unwrap();

        let all = queue.list_jobs(&JobFilter::default()).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id, b.id, a2.id]);

        let only_a = queue
            .list_jobs(&JobFilter::default().with_name("a"))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 2);

        let limited = queue
            .list_jobs(&JobFilter::default().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited[0].id, a.id);
    }

    #[tokio::test]
    async fn stats_counts_statuses() {
        let queue = InMemoryJobQueue::default();
        queue.add_job(JobSpec::new("a", json!({}))).await.unwrap();
        queue.add_job(JobSpec::new("b", json!({}))).await.unwrap();
        queue.get_next_job("agent-1").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn broadcast_works() {
        let queue = InMemoryJobQueue::default();
        let mut rx = queue.subscribe();

        let job = queue.add_job(JobSpec::new("HelloWorld", json!({}))).await.unwrap();
        match rx.recv().await.unwrap() {
            JobEvent::Added { id, name } => {
                assert_eq!(id, job.id);
                assert_eq!(name, "HelloWorld");
            }
            other => panic!("Expected Added, got {other:?}"),
        }

        queue.get_next_job("agent-1").await.unwrap();
        match rx.recv().await.unwrap() {
            JobEvent::Leased { id, agent_id, attempt } => {
                assert_eq!(id, job.id);
                assert_eq!(agent_id, "agent-1");
                assert_eq!(attempt, 1);
            }
            other => panic!("Expected Leased, got {other:?}"),
        }
    }
}

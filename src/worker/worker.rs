//! Per-agent worker execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{JobError, TaskError};
use crate::jobs::model::deadline;
use crate::jobs::{Job, JobAttempts, StatusUpdate};
use crate::queue::JobQueue;
use crate::tasks::{Task, TaskFactory};

/// What happened to a leased job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        id: Uuid,
        result: Value,
    },
    /// Requeued after a recoverable failure.
    Retrying {
        id: Uuid,
        attempts: JobAttempts,
        delay_until: Option<DateTime<Utc>>,
        error: String,
    },
    Failed {
        id: Uuid,
        error: String,
    },
    /// The lease ran out before the task finished. The job is left for
    /// lease expiry to hand to another agent.
    Abandoned {
        id: Uuid,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Completed { id, .. }
            | Self::Retrying { id, .. }
            | Self::Failed { id, .. }
            | Self::Abandoned { id } => *id,
        }
    }
}

/// How a single execution ended.
enum Run {
    Finished(Result<Value, TaskError>),
    LeaseLost,
}

/// Processes one job at a time for a single agent id.
pub struct Worker {
    agent_id: String,
    queue: Arc<dyn JobQueue>,
    factory: Arc<TaskFactory>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        agent_id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        factory: Arc<TaskFactory>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            queue,
            factory,
            config,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Lease and process at most one job.
    ///
    /// Returns `Ok(None)` when nothing was eligible. Errors are queue errors;
    /// task failures are reported through the outcome.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, JobError> {
        let Some(job) = self.queue.get_next_job(&self.agent_id).await? else {
            return Ok(None);
        };
        let attempt = job.attempts.current() + 1;
        info!(
            job_id = %job.id,
            name = %job.name,
            agent_id = %self.agent_id,
            attempt,
            max_attempts = job.attempts.max(),
            "Running job"
        );

        let task = match self.factory.create_task(&job).await {
            Ok(task) => task,
            Err(e) => {
                // Retrying cannot make an unknown task name resolve
                let error = e.to_string();
                error!(job_id = %job.id, name = %job.name, "{error}");
                let outcome = self
                    .settle(&job, StatusUpdate::failed(error.clone()), JobOutcome::Failed {
                        id: job.id,
                        error,
                    })
                    .await?;
                return Ok(Some(outcome));
            }
        };

        let lease = job.lease_remaining(Utc::now()).unwrap_or(Duration::ZERO);
        let outcome = match self.execute(&job, task.as_ref(), lease).await {
            Run::Finished(Ok(result)) => {
                let outcome = self
                    .settle(&job, StatusUpdate::completed(result.clone()), JobOutcome::Completed {
                        id: job.id,
                        result,
                    })
                    .await?;
                if matches!(outcome, JobOutcome::Completed { .. }) {
                    info!(job_id = %job.id, agent_id = %self.agent_id, attempt, "Job completed");
                }
                outcome
            }
            Run::Finished(Err(e)) => self.record_failure(&job, e).await?,
            Run::LeaseLost => {
                warn!(
                    job_id = %job.id,
                    agent_id = %self.agent_id,
                    lease_secs = lease.as_secs_f64(),
                    "Lease ran out mid-run, abandoning job"
                );
                JobOutcome::Abandoned { id: job.id }
            }
        };
        Ok(Some(outcome))
    }

    /// Run the task, bounded by the lease.
    ///
    /// Without a heartbeat the remaining lease is a hard ceiling. With one,
    /// the lease is renewed on every tick and the run is dropped once renewal
    /// fails.
    async fn execute(&self, job: &Job, task: &dyn Task, lease: Duration) -> Run {
        let run = task.execute(&job.payload);

        let Some(every) = self.config.heartbeat_interval else {
            return match tokio::time::timeout(lease, run).await {
                Ok(result) => Run::Finished(result),
                Err(_) => Run::LeaseLost,
            };
        };

        tokio::pin!(run);
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                result = &mut run => return Run::Finished(result),
                _ = tick.tick() => {
                    let renew_for = lease.max(every.saturating_mul(2));
                    match self.queue.extend_lease(job.id, &self.agent_id, renew_for).await {
                        Ok(_) => debug!(job_id = %job.id, "Lease renewed"),
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "Lease renewal failed");
                            return Run::LeaseLost;
                        }
                    }
                }
            }
        }
    }

    /// Requeue within budget, otherwise fail with the error kept.
    async fn record_failure(&self, job: &Job, err: TaskError) -> Result<JobOutcome, JobError> {
        let error = err.to_string();
        let (attempts, retry) = match job.attempts.after_failure_with(self.config.increment_policy) {
            Ok(counted) => counted,
            Err(exhausted) => {
                let error = format!("{error} ({exhausted})");
                error!(
                    job_id = %job.id,
                    agent_id = %self.agent_id,
                    attempts = job.attempts.current(),
                    max_attempts = job.attempts.max(),
                    "Job failed past its budget: {error}"
                );
                return self
                    .settle(job, StatusUpdate::failed(error.clone()), JobOutcome::Failed {
                        id: job.id,
                        error,
                    })
                    .await;
            }
        };

        if retry && err.is_retryable() {
            let now = Utc::now();
            let delay_until = job
                .backoff
                .delay_for(attempts.current())
                .map(|d| deadline(now, d));
            warn!(
                job_id = %job.id,
                agent_id = %self.agent_id,
                attempts = attempts.current(),
                max_attempts = attempts.max(),
                delayed = delay_until.is_some(),
                "Job failed, will retry: {error}"
            );
            let update = StatusUpdate::retry(attempts, error.clone(), delay_until);
            return self
                .settle(job, update, JobOutcome::Retrying {
                    id: job.id,
                    attempts,
                    delay_until,
                    error,
                })
                .await;
        }

        error!(
            job_id = %job.id,
            agent_id = %self.agent_id,
            attempts = attempts.current(),
            max_attempts = attempts.max(),
            "Job failed: {error}"
        );
        let update = StatusUpdate::failed(error.clone()).with_attempts(attempts);
        self.settle(job, update, JobOutcome::Failed { id: job.id, error })
            .await
    }

    /// Write the update as the lease holder.
    ///
    /// If another agent has taken the job over in the meantime the write is
    /// refused and the run counts as abandoned.
    async fn settle(
        &self,
        job: &Job,
        update: StatusUpdate,
        outcome: JobOutcome,
    ) -> Result<JobOutcome, JobError> {
        match self
            .queue
            .update_job_status(job.id, update.owned_by(&self.agent_id))
            .await
        {
            Ok(_) => Ok(outcome),
            Err(JobError::NotLeaseOwner { .. }) => {
                warn!(
                    job_id = %job.id,
                    agent_id = %self.agent_id,
                    "Lease was taken over before the result was written, discarding it"
                );
                Ok(JobOutcome::Abandoned { id: job.id })
            }
            Err(e) => Err(e),
        }
    }

    /// Spawn the polling loop. Set `shutdown` to stop it; a job already
    /// running is finished first.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(agent_id = %self.agent_id, "Worker started");

            let mut tick = tokio::time::interval(self.config.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                // Drain everything eligible before waiting for the next tick
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        info!(agent_id = %self.agent_id, "Worker shutting down");
                        return;
                    }
                    match self.run_once().await {
                        Ok(Some(outcome)) => {
                            debug!(job_id = %outcome.job_id(), agent_id = %self.agent_id, "Job processed");
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(agent_id = %self.agent_id, "Worker queue error: {e}");
                            break;
                        }
                    }
                }
            }
        })
    }
}

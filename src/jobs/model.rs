//! Job entity, its name value object, and the inputs that create or update it.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::attempts::{DEFAULT_MAX_ATTEMPTS, JobAttempts};
use crate::jobs::backoff::Backoff;
use crate::jobs::state::JobStatus;

/// Error recorded when a lease runs out and the budget is already spent.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// Non-empty name selecting the task that runs a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobName(String);

impl JobName {
    pub fn new(name: impl Into<String>) -> Result<Self, JobError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(JobError::Validation("job name must not be empty".to_string()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobName {
    type Error = JobError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobName> for String {
    fn from(name: JobName) -> Self {
        name.0
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Total attempts allowed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Higher priorities are leased first.
    #[serde(default)]
    pub priority: i32,
    /// Hold the job as Delayed for this long before it can be leased.
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl JobSpec {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
            delay_ms: None,
            backoff: Backoff::None,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Requested status change, with whatever data the new status carries.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    /// Task output; only meaningful for `Completed`.
    pub result: Option<serde_json::Value>,
    /// Error text retained for operators.
    pub error: Option<String>,
    /// Replacement attempts value, when the caller spent part of the budget.
    pub attempts: Option<JobAttempts>,
    /// Required for `Delayed`.
    pub delay_until: Option<DateTime<Utc>>,
    /// Agent that must still hold the lease for the update to apply.
    pub owner: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            attempts: None,
            delay_until: None,
            owner: None,
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new(JobStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(JobStatus::Failed)
        }
    }

    /// Requeue after a failure: Waiting now, or Delayed until `delay_until`.
    pub fn retry(
        attempts: JobAttempts,
        error: impl Into<String>,
        delay_until: Option<DateTime<Utc>>,
    ) -> Self {
        let status = if delay_until.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        Self {
            error: Some(error.into()),
            attempts: Some(attempts),
            delay_until,
            ..Self::new(status)
        }
    }

    pub fn with_attempts(mut self, attempts: JobAttempts) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Only apply while `agent_id` holds the job's lease.
    pub fn owned_by(mut self, agent_id: impl Into<String>) -> Self {
        self.owner = Some(agent_id.into());
        self
    }
}

/// A unit of requested asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: JobName,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: JobAttempts,
    pub priority: i32,
    pub backoff: Backoff,
    /// Present only once Completed.
    pub result: Option<serde_json::Value>,
    /// Most recent failure, kept across retries.
    pub last_error: Option<String>,
    /// Present only while Active.
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Present only while Delayed.
    pub delay_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Validate a spec and build a fresh job from it.
    pub fn from_spec(spec: JobSpec, now: DateTime<Utc>) -> Result<Self, JobError> {
        let name = JobName::new(spec.name)?;
        let attempts = JobAttempts::with_max(spec.max_attempts)?;
        spec.backoff.validate()?;

        let delay_until = spec
            .delay_ms
            .filter(|ms| *ms > 0)
            .map(|ms| deadline(now, Duration::from_millis(ms)));
        let status = if delay_until.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            payload: spec.payload,
            status,
            attempts,
            priority: spec.priority,
            backoff: spec.backoff,
            result: None,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            delay_until,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        })
    }

    /// Whether the lease on an Active job has run out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Whether `get_next_job` may hand this job out at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => true,
            JobStatus::Delayed => self.delay_until.is_none_or(|at| at <= now),
            JobStatus::Active => self.lease_expired(now),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Time left on the current lease.
    pub fn lease_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.lease_expires_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Fail an abandoned lease whose budget cannot absorb another run.
    ///
    /// Returns true if the job was moved to Failed.
    pub fn fail_if_lease_exhausted(&mut self, now: DateTime<Utc>) -> bool {
        if !self.lease_expired(now) {
            return false;
        }
        let (next, retry) = self.attempts.after_failure();
        if retry {
            return false;
        }
        self.attempts = next;
        self.status = JobStatus::Failed;
        self.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
        self.clear_lease();
        self.finished_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Hand the job to `agent_id` until `now + lease`.
    ///
    /// Re-leasing an expired Active job counts the abandoned run as a failure.
    /// Callers must check [`Job::is_eligible`] first.
    pub fn lease_to(&mut self, agent_id: &str, lease: Duration, now: DateTime<Utc>) {
        if self.status == JobStatus::Active {
            self.attempts = self.attempts.increment();
            self.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
        }
        self.status = JobStatus::Active;
        self.lease_owner = Some(agent_id.to_string());
        self.lease_expires_at = Some(deadline(now, lease));
        self.delay_until = None;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Push the lease deadline out, if `agent_id` still holds it.
    pub fn extend_lease(
        &mut self,
        agent_id: &str,
        by: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        if self.status != JobStatus::Active || self.lease_owner.as_deref() != Some(agent_id) {
            return Err(JobError::NotLeaseOwner {
                id: self.id,
                agent_id: agent_id.to_string(),
            });
        }
        self.lease_expires_at = Some(deadline(now, by));
        self.updated_at = now;
        Ok(())
    }

    /// Apply a status change after checking it is a legal transition.
    pub fn apply_update(&mut self, update: StatusUpdate, now: DateTime<Utc>) -> Result<(), JobError> {
        if let Some(owner) = &update.owner
            && (self.status != JobStatus::Active || self.lease_owner.as_ref() != Some(owner))
        {
            return Err(JobError::NotLeaseOwner {
                id: self.id,
                agent_id: owner.clone(),
            });
        }
        if !self.status.can_transition_to(update.status) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: update.status,
            });
        }
        if update.status == JobStatus::Delayed && update.delay_until.is_none() {
            return Err(JobError::Validation(
                "delayed status requires delay_until".to_string(),
            ));
        }
        if let Some(attempts) = update.attempts
            && attempts.max() != self.attempts.max()
        {
            return Err(JobError::Validation(format!(
                "attempts max cannot change from {} to {}",
                self.attempts.max(),
                attempts.max()
            )));
        }

        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if update.error.is_some() {
            self.last_error = update.error;
        }

        match update.status {
            JobStatus::Completed => {
                self.result = update.result;
                self.finished_at = Some(now);
            }
            JobStatus::Failed => {
                self.finished_at = Some(now);
            }
            JobStatus::Waiting => {
                self.delay_until = None;
            }
            JobStatus::Delayed => {
                self.delay_until = update.delay_until.map(clamp_deadline);
            }
            JobStatus::Active => {}
        }

        self.status = update.status;
        self.clear_lease();
        self.updated_at = now;
        Ok(())
    }

    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

/// Latest instant a deadline may name: the end of year 9999, so every
/// stored timestamp keeps a four-digit year and sorts as text.
pub fn latest_deadline() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_micro_opt(23, 59, 59, 999_999))
        .map(|n| n.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn clamp_deadline(at: DateTime<Utc>) -> DateTime<Utc> {
    at.min(latest_deadline())
}

/// `now + d`, saturating at [`latest_deadline`].
pub(crate) fn deadline(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or_else(latest_deadline, clamp_deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_job(spec: JobSpec) -> Job {
        Job::from_spec(spec, Utc::now()).unwrap()
    }

    #[test]
    fn new_job_is_waiting_with_zero_attempts() {
        let job = make_job(JobSpec::new("HelloWorld", json!({})));
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts.current(), 0);
        assert_eq!(job.attempts.max(), 3);
        assert!(job.result.is_none());
        assert!(job.lease_owner.is_none());
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = Job::from_spec(JobSpec::new("   ", json!({})), Utc::now());
        assert!(matches!(err, Err(JobError::Validation(_))));
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let err = Job::from_spec(
            JobSpec::new("HelloWorld", json!({})).with_max_attempts(0),
            Utc::now(),
        );
        assert!(matches!(err, Err(JobError::Validation(_))));
    }

    #[test]
    fn delayed_spec_starts_delayed() {
        let now = Utc::now();
        let job = Job::from_spec(
            JobSpec::new("HelloWorld", json!({})).with_delay(Duration::from_secs(60)),
            now,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn lease_sets_owner_and_deadline() {
        let now = Utc::now();
        let mut job = make_job(JobSpec::new("HelloWorld", json!({})));
        job.lease_to("agent-1", Duration::from_secs(30), now);

        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.lease_owner.as_deref(), Some("agent-1"));
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + chrono::Duration::seconds(31)));
        assert_eq!(job.lease_remaining(now), Some(Duration::from_secs(30)));
    }

    #[test]
    fn releasing_expired_lease_counts_an_attempt() {
        let now = Utc::now();
        let mut job = make_job(JobSpec::new("HelloWorld", json!({})));
        job.lease_to("agent-1", Duration::from_secs(1), now);

        let later = now + chrono::Duration::seconds(2);
        assert!(!job.fail_if_lease_exhausted(later));
        job.lease_to("agent-2", Duration::from_secs(1), later);

        assert_eq!(job.lease_owner.as_deref(), Some("agent-2"));
        assert_eq!(job.attempts.current(), 1);
    }

    #[test]
    fn exhausted_expired_lease_fails_job() {
        let now = Utc::now();
        let mut job = make_job(JobSpec::new("HelloWorld", json!({})).with_max_attempts(1));
        job.lease_to("agent-1", Duration::from_secs(1), now);

        assert!(job.fail_if_lease_exhausted(now + chrono::Duration::seconds(2)));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
        assert!(job.lease_owner.is_none());
    }

    #[test]
    fn extend_lease_requires_owner() {
        let now = Utc::now();
        let mut job = make_job(JobSpec::new("HelloWorld", json!({})));
        job.lease_to("agent-1", Duration::from_secs(1), now);

        assert!(job.extend_lease("agent-1", Duration::from_secs(10), now).is_ok());
        assert!(matches!(
            job.extend_lease("agent-2", Duration::from_secs(10), now),
            Err(JobError::NotLeaseOwner { .. })
        ));
    }

    #[test]
    fn complete_clears_lease_and_stores_result() {
        let now = Utc::now();
        let mut job = make_job(JobSpec::new("HelloWorld", json!({})));
        job.lease_to("agent-1", Duration::from_secs(30), now);
        job.apply_update(StatusUpdate::completed(json!({"ok": true})), now)
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert!(job.lease_owner.is_none());
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn terminal_job_rejects_updates() {
        let now = Utc::now();
        let mut job = make_job(JobSpec::new("HelloWorld", json!({})));
        job.lease_to("agent-1", Duration::from_secs(30), now);
        job.apply_update(StatusUpdate::failed("boom"), now).unwrap();

        let err = job.apply_update(StatusUpdate::new(JobStatus::Waiting), now);
        assert!(matches!(err, Err(JobError::InvalidTransition { .. })));
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn delayed_update_requires_deadline() {
        let now = Utc::now();
        let mut job = make_job(JobSpec::new("HelloWorld", json!({})));
        job.lease_to("agent-1", Duration::from_secs(30), now);

        let err = job.apply_update(StatusUpdate::new(JobStatus::Delayed), now);
        assert!(matches!(err, Err(JobError::Validation(_))));
        assert_eq!(job.status, JobStatus::Active);
    }

    #[test]
    fn retry_update_picks_status_from_delay() {
        let attempts = JobAttempts::create(1, 3).unwrap();
        assert_eq!(
            StatusUpdate::retry(attempts, "e", None).status,
            JobStatus::Waiting
        );
        assert_eq!(
            StatusUpdate::retry(attempts, "e", Some(Utc::now())).status,
            JobStatus::Delayed
        );
    }

    #[test]
    fn stale_owner_cannot_update() {
        let now = Utc::now();
        let mut job = make_job(JobSpec::new("HelloWorld", json!({})));
        job.lease_to("agent-1", Duration::from_secs(1), now);
        job.lease_to("agent-2", Duration::from_secs(30), now + chrono::Duration::seconds(2));

        let err = job.apply_update(StatusUpdate::completed(json!("stale")).owned_by("agent-1"), now);
        assert!(matches!(err, Err(JobError::NotLeaseOwner { .. })));
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.lease_owner.as_deref(), Some("agent-2"));
        assert_eq!(job.attempts.current(), 1);

        job.apply_update(StatusUpdate::completed(json!("ok")).owned_by("agent-2"), now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn owned_update_on_released_job_is_rejected() {
        let now = Utc::now();
        let mut job = make_job(JobSpec::new("HelloWorld", json!({})));
        let err = job.apply_update(StatusUpdate::failed("x").owned_by("agent-1"), now);
        assert!(matches!(err, Err(JobError::NotLeaseOwner { .. })));
        assert_eq!(job.status, JobStatus::Waiting);
    }

    #[test]
    fn far_future_deadlines_keep_four_digit_years() {
        let now = Utc::now();
        let job = Job::from_spec(
            JobSpec::new("HelloWorld", json!({})).with_delay(Duration::MAX),
            now,
        )
        .unwrap();
        assert_eq!(job.delay_until, Some(latest_deadline()));
        assert!(!job.is_eligible(now));
        assert_eq!(
            latest_deadline().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            "9999-12-31T23:59:59.999999Z"
        );
        assert_eq!(deadline(now, Duration::from_secs(60)), now + chrono::Duration::seconds(60));
    }

    #[test]
    fn with_delay_saturates_millis() {
        let spec = JobSpec::new("HelloWorld", json!({})).with_delay(Duration::MAX);
        assert_eq!(spec.delay_ms, Some(u64::MAX));
    }

    #[test]
    fn job_name_serde_validates() {
        assert!(serde_json::from_str::<JobName>("\"\"").is_err());
        let name: JobName = serde_json::from_str("\"HelloWorld\"").unwrap();
        assert_eq!(name.as_str(), "HelloWorld");
    }
}

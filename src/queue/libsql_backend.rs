//! libSQL backend: durable `JobQueue` implementation.
//!
//! Leasing is one `UPDATE ... WHERE seq = (SELECT ... LIMIT 1) RETURNING`
//! statement, so the store's own statement atomicity keeps leases exclusive.
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{DatabaseError, JobError};
use crate::jobs::model::deadline;
use crate::jobs::{Backoff, Job, JobAttempts, JobName, JobSpec, JobStatus, LEASE_EXPIRED_ERROR, StatusUpdate};
use crate::queue::migrations;
use crate::queue::traits::{JobEvent, JobFilter, JobQueue, JobStats};

/// Optimistic write retries before giving up on a contended update.
const MAX_UPDATE_RETRIES: usize = 3;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobQueue {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    config: QueueConfig,
    tx: broadcast::Sender<JobEvent>,
}

impl LibSqlJobQueue {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, config: QueueConfig) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let queue = Self::from_database(db, config).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(queue)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(config: QueueConfig) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, config).await
    }

    async fn from_database(db: LibSqlDatabase, config: QueueConfig) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;

        let (tx, _rx) = broadcast::channel(config.event_capacity.max(1));
        Ok(Self {
            db: Arc::new(db),
            conn,
            config,
            tx,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    /// Fail Active jobs whose lease ran out and whose budget cannot absorb
    /// another run. Returns their IDs.
    async fn fail_exhausted_leases(&self, now: &str) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE jobs SET status = 'failed', \
                   attempts_current = MIN(attempts_current + 1, attempts_max), \
                   last_error = ?2, lease_owner = NULL, lease_expires_at = NULL, \
                   finished_at = ?1, updated_at = ?1 \
                 WHERE status = 'active' AND lease_expires_at <= ?1 \
                   AND attempts_current + 1 >= attempts_max \
                 RETURNING id",
                params![now, LEASE_EXPIRED_ERROR],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_exhausted_leases: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = next_row(&mut rows, "fail_exhausted_leases").await? {
            let id_str: String = row.get(0).unwrap_or_default();
            if let Ok(id) = Uuid::parse_str(&id_str) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    /// Write back a job read at `prev_status`/`prev_updated`, unless someone
    /// else changed it first. Returns false on conflict.
    async fn write_back(
        &self,
        job: &Job,
        prev_status: JobStatus,
        prev_updated: &str,
        prev_owner: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = match &job.result {
            Some(v) => libsql::Value::Text(serialize(v)?),
            None => libsql::Value::Null,
        };
        let attempts_current = i64::from(job.attempts.current());
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, attempts_current = ?2, result = ?3, last_error = ?4, \
                   lease_owner = ?5, lease_expires_at = ?6, delay_until = ?7, updated_at = ?8, \
                   finished_at = ?9 \
                 WHERE id = ?10 AND status = ?11 AND updated_at = ?12 AND lease_owner IS ?13",
                params![
                    job.status.as_str(),
                    attempts_current,
                    result,
                    opt_text(job.last_error.as_deref()),
                    opt_text(job.lease_owner.as_deref()),
                    opt_ts(job.lease_expires_at),
                    opt_ts(job.delay_until),
                    fmt_ts(job.updated_at),
                    opt_ts(job.finished_at),
                    job.id.to_string(),
                    prev_status.as_str(),
                    prev_updated,
                    opt_text(prev_owner),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job_status: {e}")))?;
        Ok(count > 0)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamps so that string order matches time order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn serialize<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Column order for `row_to_job`.
const JOB_COLUMNS: &str = "id, name, payload, status, attempts_current, attempts_max, priority, \
    backoff, result, last_error, lease_owner, lease_expires_at, delay_until, created_at, \
    updated_at, started_at, finished_at";

/// Map a libsql Row to a Job.
///
/// 0:id, 1:name, 2:payload, 3:status, 4:attempts_current, 5:attempts_max,
/// 6:priority, 7:backoff, 8:result, 9:last_error, 10:lease_owner,
/// 11:lease_expires_at, 12:delay_until, 13:created_at, 14:updated_at,
/// 15:started_at, 16:finished_at
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("job.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.id parse: {e}")))?;

    let name_str: String = row.get(1).map_err(|e| DatabaseError::Query(format!("job.name: {e}")))?;
    let name = JobName::new(name_str).map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    let payload_str: String = row.get(2).unwrap_or_else(|_| "null".to_string());
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.payload: {e}")))?;

    let status_str: String = row.get(3).map_err(|e| DatabaseError::Query(format!("job.status: {e}")))?;
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown job status {status_str}")))?;

    let current: i64 = row.get(4).unwrap_or(0);
    let max: i64 = row.get(5).map_err(|e| DatabaseError::Query(format!("job.attempts_max: {e}")))?;
    let attempts = JobAttempts::create(
        u32::try_from(current).unwrap_or(0),
        u32::try_from(max).unwrap_or(0),
    )
    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    let priority: i64 = row.get(6).unwrap_or(0);

    let backoff_str: Option<String> = row.get(7).ok();
    let backoff: Backoff = backoff_str
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    let result_str: Option<String> = row.get(8).ok();
    let result = result_str.and_then(|s| serde_json::from_str(&s).ok());

    let created_str: String = row.get(13).unwrap_or_default();
    let updated_str: String = row.get(14).unwrap_or_default();

    Ok(Job {
        id,
        name,
        payload,
        status,
        attempts,
        priority: i32::try_from(priority).unwrap_or(0),
        backoff,
        result,
        last_error: row.get(9).ok(),
        lease_owner: row.get(10).ok(),
        lease_expires_at: parse_optional_datetime(&row.get(11).ok()),
        delay_until: parse_optional_datetime(&row.get(12).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        started_at: parse_optional_datetime(&row.get(15).ok()),
        finished_at: parse_optional_datetime(&row.get(16).ok()),
    })
}

/// Advance a cursor, surfacing read errors instead of ending early.
async fn next_row(rows: &mut libsql::Rows, op: &str) -> Result<Option<libsql::Row>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: reading row: {e}")))
}

async fn collect_jobs(mut rows: libsql::Rows) -> Result<Vec<Job>, DatabaseError> {
    let mut jobs = Vec::new();
    while let Some(row) = next_row(&mut rows, "list_jobs").await? {
        match row_to_job(&row) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping job row: {e}"),
        }
    }
    Ok(jobs)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobQueue for LibSqlJobQueue {
    async fn add_job(&self, spec: JobSpec) -> Result<Job, JobError> {
        let job = Job::from_spec(spec, Utc::now())?;

        self.conn()
            .execute(
                "INSERT INTO jobs (id, name, payload, status, attempts_current, attempts_max, \
                   priority, backoff, delay_until, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job.id.to_string(),
                    job.name.as_str(),
                    serialize(&job.payload)?,
                    job.status.as_str(),
                    i64::from(job.attempts.current()),
                    i64::from(job.attempts.max()),
                    i64::from(job.priority),
                    serialize(&job.backoff)?,
                    opt_ts(job.delay_until),
                    fmt_ts(job.created_at),
                    fmt_ts(job.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_job: {e}")))?;

        info!(job_id = %job.id, name = %job.name, status = %job.status, "Job added");
        self.emit(JobEvent::Added {
            id: job.id,
            name: job.name.to_string(),
        });
        Ok(job)
    }

    async fn get_next_job(&self, agent_id: &str) -> Result<Option<Job>, JobError> {
        let now = Utc::now();
        let now_str = fmt_ts(now);

        for id in self.fail_exhausted_leases(&now_str).await? {
            warn!(job_id = %id, "Lease expired with no attempts left, job failed");
            self.emit(JobEvent::StatusChanged {
                id,
                from: JobStatus::Active,
                to: JobStatus::Failed,
            });
        }

        let lease_until = fmt_ts(deadline(now, self.config.lease_duration));
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE jobs SET \
                       attempts_current = CASE WHEN status = 'active' \
                         THEN attempts_current + 1 ELSE attempts_current END, \
                       last_error = CASE WHEN status = 'active' THEN ?4 ELSE last_error END, \
                       status = 'active', lease_owner = ?1, lease_expires_at = ?2, \
                       delay_until = NULL, started_at = ?3, updated_at = ?3 \
                     WHERE seq = ( \
                       SELECT seq FROM jobs \
                       WHERE status = 'waiting' \
                          OR (status = 'delayed' AND (delay_until IS NULL OR delay_until <= ?3)) \
                          OR (status = 'active' AND lease_expires_at <= ?3 \
                              AND attempts_current + 1 < attempts_max) \
                       ORDER BY priority DESC, seq ASC \
                       LIMIT 1 \
                     ) \
                     RETURNING {JOB_COLUMNS}"
                ),
                params![agent_id, lease_until, now_str, LEASE_EXPIRED_ERROR],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_next_job: {e}")))?;

        let leased = match rows.next().await {
            Ok(Some(row)) => row_to_job(&row)?,
            Ok(None) => {
                debug!(agent_id, "No eligible jobs");
                return Ok(None);
            }
            Err(e) => return Err(DatabaseError::Query(format!("get_next_job: {e}")).into()),
        };

        info!(job_id = %leased.id, name = %leased.name, agent_id, "Job leased");
        self.emit(JobEvent::Leased {
            id: leased.id,
            agent_id: agent_id.to_string(),
            attempt: leased.attempts.current() + 1,
        });
        Ok(Some(leased))
    }

    async fn update_job_status(&self, id: Uuid, update: StatusUpdate) -> Result<Job, JobError> {
        for _ in 0..MAX_UPDATE_RETRIES {
            let mut job = self.fetch(id).await?.ok_or(JobError::NotFound { id })?;
            let from = job.status;
            let prev_updated = fmt_ts(job.updated_at);
            let prev_owner = job.lease_owner.clone();

            job.apply_update(update.clone(), Utc::now())?;

            if self
                .write_back(&job, from, &prev_updated, prev_owner.as_deref())
                .await?
            {
                debug!(job_id = %id, from = %from, to = %job.status, "Job status updated");
                self.emit(JobEvent::StatusChanged {
                    id,
                    from,
                    to: job.status,
                });
                return Ok(job);
            }
            debug!(job_id = %id, "Concurrent job update, retrying");
        }

        Err(DatabaseError::Query(format!(
            "update_job_status: job {id} kept changing underneath the update"
        ))
        .into())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(self.fetch(id).await?)
    }

    async fn remove_job(&self, id: Uuid, force: bool) -> Result<Job, JobError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "DELETE FROM jobs WHERE id = ?1 AND (?2 = 1 OR status != 'active') \
                     RETURNING {JOB_COLUMNS}"
                ),
                params![id.to_string(), i64::from(force)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let removed = row_to_job(&row)?;
                info!(job_id = %id, status = %removed.status, force, "Job removed");
                self.emit(JobEvent::Removed { id });
                Ok(removed)
            }
            Ok(None) => match self.fetch(id).await? {
                Some(job) if job.status == JobStatus::Active => Err(JobError::LeaseHeld {
                    id,
                    owner: job.lease_owner.unwrap_or_default(),
                }),
                _ => Err(JobError::NotFound { id }),
            },
            Err(e) => Err(DatabaseError::Query(format!("remove_job: {e}")).into()),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = filter
            .limit
            .and_then(|l| i64::try_from(l).ok())
            .unwrap_or(-1);
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR name = ?2) \
                     ORDER BY seq ASC LIMIT ?3"
                ),
                params![
                    opt_text(filter.status.map(|s| s.as_str())),
                    opt_text(filter.name.as_deref()),
                    limit,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;

        Ok(collect_jobs(rows).await?)
    }

    async fn extend_lease(&self, id: Uuid, agent_id: &str, by: Duration) -> Result<Job, JobError> {
        let now = Utc::now();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE jobs SET lease_expires_at = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND status = 'active' AND lease_owner = ?4 \
                     RETURNING {JOB_COLUMNS}"
                ),
                params![
                    fmt_ts(deadline(now, by)),
                    fmt_ts(now),
                    id.to_string(),
                    agent_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("extend_lease: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                debug!(job_id = %id, agent_id, "Lease extended");
                Ok(row_to_job(&row)?)
            }
            Ok(None) => match self.fetch(id).await? {
                Some(_) => Err(JobError::NotLeaseOwner {
                    id,
                    agent_id: agent_id.to_string(),
                }),
                None => Err(JobError::NotFound { id }),
            },
            Err(e) => Err(DatabaseError::Query(format!("extend_lease: {e}")).into()),
        }
    }

    async fn stats(&self) -> Result<JobStats, JobError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM jobs GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;

        let mut stats = JobStats::default();
        while let Some(row) = next_row(&mut rows, "stats").await? {
            let status_str: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            if let Some(status) = JobStatus::parse(&status_str) {
                stats.record(status, usize::try_from(count).unwrap_or(0));
            }
        }
        Ok(stats)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

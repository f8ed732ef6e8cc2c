//! Job status state machine.

use serde::{Deserialize, Serialize};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is queued and eligible for leasing.
    Waiting,
    /// Job is leased by a worker and executing.
    Active,
    /// Job finished successfully.
    Completed,
    /// Job failed and will not be retried.
    Failed,
    /// Job is queued but not eligible until its delay elapses.
    Delayed,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        Self::Waiting,
        Self::Delayed,
        Self::Active,
        Self::Completed,
        Self::Failed,
    ];

    /// Check whether `update_job_status` may move a job from this status to `target`.
    ///
    /// `Active` is never a valid target here: only a lease can activate a job.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Active
            (Active, Completed) | (Active, Failed) |
            (Active, Waiting) | (Active, Delayed) |
            // Queued jobs can be rescheduled or failed by an operator
            (Waiting, Delayed) | (Waiting, Failed) |
            (Delayed, Waiting) | (Delayed, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase name, used for display and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }

    /// Parse the stable name produced by [`JobStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "delayed" => Some(Self::Delayed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

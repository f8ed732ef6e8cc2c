//! Retry budget value object.

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Default retry budget for jobs that do not set one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What [`JobAttempts::increment_with`] does once the budget is spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IncrementPolicy {
    /// Return an unchanged copy.
    #[default]
    Saturate,
    /// Return a validation error.
    Strict,
}

impl IncrementPolicy {
    /// Parse `saturate` or `strict`, ignoring case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "saturate" => Some(Self::Saturate),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

/// Immutable `(current, max)` attempts pair with `current <= max` and `max >= 1`.
///
/// `current` counts failed attempts so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAttempts", into = "RawAttempts")]
pub struct JobAttempts {
    current: u32,
    max: u32,
}

impl JobAttempts {
    /// Validate and build an attempts value.
    pub fn create(current: u32, max: u32) -> Result<Self, JobError> {
        if max < 1 {
            return Err(JobError::Validation(format!(
                "max attempts must be at least 1, got {max}"
            )));
        }
        if current > max {
            return Err(JobError::Validation(format!(
                "current attempts {current} exceeds max {max}"
            )));
        }
        Ok(Self { current, max })
    }

    /// A fresh budget with no attempts used.
    pub fn with_max(max: u32) -> Result<Self, JobError> {
        Self::create(0, max)
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// `current < max`.
    pub fn can_retry(&self) -> bool {
        self.current < self.max
    }

    /// Count one more attempt, saturating at `max`.
    pub fn increment(&self) -> Self {
        if self.can_retry() {
            Self {
                current: self.current + 1,
                max: self.max,
            }
        } else {
            *self
        }
    }

    /// Count one more attempt under an explicit exhaustion policy.
    pub fn increment_with(&self, policy: IncrementPolicy) -> Result<Self, JobError> {
        match policy {
            IncrementPolicy::Saturate => Ok(self.increment()),
            IncrementPolicy::Strict if self.can_retry() => Ok(self.increment()),
            IncrementPolicy::Strict => Err(JobError::Validation(format!(
                "attempts budget exhausted ({}/{})",
                self.current, self.max
            ))),
        }
    }

    /// Record a failed run and report whether another run fits the budget.
    pub fn after_failure(&self) -> (Self, bool) {
        let next = self.increment();
        (next, next.can_retry())
    }

    /// [`JobAttempts::after_failure`] under an explicit exhaustion policy.
    pub fn after_failure_with(&self, policy: IncrementPolicy) -> Result<(Self, bool), JobError> {
        let next = self.increment_with(policy)?;
        Ok((next, next.can_retry()))
    }
}

impl Default for JobAttempts {
    fn default() -> Self {
        Self {
            current: 0,
            max: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawAttempts {
    current: u32,
    max: u32,
}

impl TryFrom<RawAttempts> for JobAttempts {
    type Error = JobError;

    fn try_from(raw: RawAttempts) -> Result<Self, Self::Error> {
        Self::create(raw.current, raw.max)
    }
}

impl From<JobAttempts> for RawAttempts {
    fn from(attempts: JobAttempts) -> Self {
        Self {
            current: attempts.current,
            max: attempts.max,
        }
    }
}

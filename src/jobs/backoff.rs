//! Retry backoff policies.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Delay applied before a failed job becomes eligible again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Requeue as Waiting immediately.
    #[default]
    None,
    /// Same delay after every failure.
    Fixed {
        delay_ms: u64,
        #[serde(default)]
        jitter: f64,
    },
    /// `base_ms * 2^(failures - 1)`, capped at `max_ms`.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter: f64,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: millis(delay),
            jitter: 0.0,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base_ms: millis(base),
            max_ms: millis(max),
            jitter: 0.0,
        }
    }

    /// Randomly shave up to `ratio` of each delay.
    pub fn with_jitter(self, ratio: f64) -> Self {
        match self {
            Self::None => Self::None,
            Self::Fixed { delay_ms, .. } => Self::Fixed {
                delay_ms,
                jitter: ratio,
            },
            Self::Exponential {
                base_ms, max_ms, ..
            } => Self::Exponential {
                base_ms,
                max_ms,
                jitter: ratio,
            },
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        let (delay, jitter) = match *self {
            Self::None => return Ok(()),
            Self::Fixed { delay_ms, jitter } => (delay_ms, jitter),
            Self::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => {
                if max_ms < base_ms {
                    return Err(JobError::Validation(format!(
                        "backoff max {max_ms}ms is below base {base_ms}ms"
                    )));
                }
                (base_ms, jitter)
            }
        };
        if delay == 0 {
            return Err(JobError::Validation(
                "backoff delay must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&jitter) {
            return Err(JobError::Validation(format!(
                "backoff jitter must be between 0 and 1, got {jitter}"
            )));
        }
        Ok(())
    }

    /// Delay after the given number of failed attempts, or `None` for an
    /// immediate requeue.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        let (ms, jitter) = match *self {
            Self::None => return None,
            Self::Fixed { delay_ms, jitter } => (delay_ms, jitter),
            Self::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => {
                let exp = failures.saturating_sub(1).min(32);
                let ms = base_ms.saturating_mul(1u64 << exp).min(max_ms);
                (ms, jitter)
            }
        };

        let ms = if jitter > 0.0 && ms > 0 {
            let cut = rand::thread_rng().gen_range(0.0..=jitter);
            ms - (ms as f64 * cut) as u64
        } else {
            ms
        };
        Some(Duration::from_millis(ms))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

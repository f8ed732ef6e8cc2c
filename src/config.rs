//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::jobs::IncrementPolicy;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a lease lasts before the job can be handed to another agent.
    pub lease_duration: Duration,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(300), // 5 minutes
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Read overrides from `AGENT_JOBS_LEASE_SECS` and `AGENT_JOBS_EVENT_CAPACITY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            lease_duration: env_parse::<u64>("AGENT_JOBS_LEASE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_duration),
            event_capacity: env_parse("AGENT_JOBS_EVENT_CAPACITY")?
                .unwrap_or(defaults.event_capacity),
        })
    }
}

/// Per-agent worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Wait between polls when the queue has nothing eligible.
    pub poll_interval: Duration,
    /// Renew the lease this often while a task runs. `None` disables renewal,
    /// so the lease duration becomes a hard execution ceiling.
    pub heartbeat_interval: Option<Duration>,
    /// How a failure is counted once the retry budget is already spent.
    pub increment_policy: IncrementPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: None,
            increment_policy: IncrementPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Read overrides from `AGENT_JOBS_POLL_MS`, `AGENT_JOBS_HEARTBEAT_SECS`
    /// and `AGENT_JOBS_INCREMENT_POLICY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let increment_policy = match std::env::var("AGENT_JOBS_INCREMENT_POLICY") {
            Ok(raw) => parse_policy(&raw)?,
            Err(_) => defaults.increment_policy,
        };
        Ok(Self {
            poll_interval: env_parse::<u64>("AGENT_JOBS_POLL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            heartbeat_interval: env_parse::<u64>("AGENT_JOBS_HEARTBEAT_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .or(defaults.heartbeat_interval),
            increment_policy,
        })
    }

    /// A heartbeat must fire before the lease it renews runs out.
    pub fn validate(&self, queue: &QueueConfig) -> Result<(), ConfigError> {
        match self.heartbeat_interval {
            Some(every) if every >= queue.lease_duration => Err(ConfigError::InvalidValue {
                key: "AGENT_JOBS_HEARTBEAT_SECS".to_string(),
                message: format!(
                    "heartbeat {every:?} must be shorter than the lease {:?}",
                    queue.lease_duration
                ),
            }),
            _ => Ok(()),
        }
    }
}

/// Host binary configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub db_path: String,
    pub agents: Vec<String>,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
}

impl HostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("AGENT_JOBS_DB_PATH")
            .unwrap_or_else(|_| "./data/agent-jobs.db".to_string());
        let agents = parse_agents(
            &std::env::var("AGENT_JOBS_AGENTS").unwrap_or_else(|_| "agent-1".to_string()),
        )?;
        let queue = QueueConfig::from_env()?;
        let worker = WorkerConfig::from_env()?;
        worker.validate(&queue)?;
        Ok(Self {
            db_path,
            agents,
            queue,
            worker,
        })
    }
}

/// Split a comma-separated agent list, rejecting an empty result.
fn parse_agents(raw: &str) -> Result<Vec<String>, ConfigError> {
    let agents: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect();
    if agents.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "AGENT_JOBS_AGENTS".to_string(),
            message: "at least one agent id is required".to_string(),
        });
    }
    Ok(agents)
}

fn parse_policy(raw: &str) -> Result<IncrementPolicy, ConfigError> {
    IncrementPolicy::parse(raw).ok_or_else(|| ConfigError::InvalidValue {
        key: "AGENT_JOBS_INCREMENT_POLICY".to_string(),
        message: format!("{raw:?}: expected saturate or strict"),
    })
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

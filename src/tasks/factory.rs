//! Runtime registry resolving job names to task constructors.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::TaskError;
use crate::jobs::Job;
use crate::tasks::task::Task;

/// Builds a fresh task for a leased job.
pub type TaskConstructor = Arc<dyn Fn(&Job) -> Box<dyn Task> + Send + Sync>;

/// Name → constructor registry.
///
/// New task types register here; dispatch never changes.
pub struct TaskFactory {
    constructors: RwLock<HashMap<String, TaskConstructor>>,
}

impl TaskFactory {
    /// Create a new empty factory.
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
        }
    }

    /// Register a constructor for `name`, replacing any previous one.
    pub async fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&Job) -> Box<dyn Task> + Send + Sync + 'static,
    {
        let name = name.into();
        let previous = self
            .constructors
            .write()
            .await
            .insert(name.clone(), Arc::new(constructor));
        if previous.is_some() {
            tracing::warn!(task = %name, "Replaced existing task constructor");
        } else {
            tracing::debug!("Registered task: {}", name);
        }
    }

    /// Remove a constructor. Returns whether one was registered.
    pub async fn unregister(&self, name: &str) -> bool {
        self.constructors.write().await.remove(name).is_some()
    }

    /// Resolve the task for `job`.
    pub async fn create_task(&self, job: &Job) -> Result<Box<dyn Task>, TaskError> {
        let constructor = self
            .constructors
            .read()
            .await
            .get(job.name.as_str())
            .cloned()
            .ok_or_else(|| TaskError::Unregistered {
                name: job.name.to_string(),
            })?;
        Ok(constructor(job))
    }

    /// Check if a task name is registered.
    pub async fn has(&self, name: &str) -> bool {
        self.constructors.read().await.contains_key(name)
    }

    /// List registered task names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TaskFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobSpec;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};

    struct Echo;

    #[async_trait]
    impl Task for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn execute(&self, payload: &Value) -> Result<Value, TaskError> {
            Ok(payload.clone())
        }
    }

    fn job(name: &str) -> Job {
        Job::from_spec(JobSpec::new(name, json!({"x": 1})), Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn resolves_registered_name() {
        let factory = TaskFactory::new();
        factory.register("Echo", |_job| Box::new(Echo)).await;

        let task = factory.create_task(&job("Echo")).await.unwrap();
        assert_eq!(task.name(), "Echo");
        assert_eq!(task.execute(&json!({"x": 1})).await.unwrap(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn unregistered_name_is_error() {
        let factory = TaskFactory::new();
        let err = factory.create_task(&job("Unknown")).await;
        assert!(matches!(err, Err(TaskError::Unregistered { ref name }) if name == "Unknown"));
    }

    #[tokio::test]
    async fn unregister_and_names() {
        let factory = TaskFactory::new();
        factory.register("b", |_job| Box::new(Echo)).await;
        factory.register("a", |_job| Box::new(Echo)).await;
        assert_eq!(factory.names().await, vec!["a".to_string(), "b".to_string()]);

        assert!(factory.unregister("a").await);
        assert!(!factory.unregister("a").await);
        assert!(!factory.has("a").await);
        assert!(factory.has("b").await);
    }
}

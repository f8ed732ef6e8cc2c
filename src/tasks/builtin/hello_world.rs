//! Greeting task, used to smoke-test a deployment end to end.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::TaskError;
use crate::tasks::task::{Task, optional_str};

pub const NAME: &str = "HelloWorld";

/// Returns `{"message": "Hello, <name>!"}`, with `name` read from the
/// payload and defaulting to `world`.
#[derive(Debug, Default)]
pub struct HelloWorldTask;

#[async_trait]
impl Task for HelloWorldTask {
    fn name(&self) -> &str {
        NAME
    }

    async fn execute(&self, payload: &Value) -> Result<Value, TaskError> {
        let name = optional_str(NAME, payload, "name")?
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("world");
        Ok(json!({ "message": format!("Hello, {name}!") }))
    }
}

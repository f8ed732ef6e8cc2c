//! The `Task` capability contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskError;

/// Executable strategy for one job name.
///
/// Tasks only do the work. Leasing, retries and persistence belong to the
/// worker and the queue, so a task may be run more than once for the same
/// job and must tolerate that.
#[async_trait]
pub trait Task: Send + Sync {
    /// Job name this task handles.
    fn name(&self) -> &str;

    /// Run against a job payload and return the result to store.
    async fn execute(&self, payload: &Value) -> Result<Value, TaskError>;
}

/// Read an optional string field from a payload object.
///
/// Missing or null fields are `None`; any other non-string value is an
/// `InvalidPayload` error.
pub fn optional_str<'a>(
    task: &str,
    payload: &'a Value,
    field: &str,
) -> Result<Option<&'a str>, TaskError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(TaskError::InvalidPayload {
            name: task.to_string(),
            reason: format!("field '{field}' must be a string, got {other}"),
        }),
    }
}

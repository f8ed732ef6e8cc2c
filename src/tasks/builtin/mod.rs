//! Built-in tasks.

pub mod hello_world;

pub use hello_world::HelloWorldTask;

use crate::tasks::TaskFactory;

/// Register every built-in task with `factory`.
pub async fn register_builtin_tasks(factory: &TaskFactory) {
    factory
        .register(hello_world::NAME, |_job| Box::new(HelloWorldTask))
        .await;
}

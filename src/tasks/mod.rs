//! Task abstraction and name-based dispatch.

pub mod builtin;
pub mod factory;
pub mod task;

pub use factory::{TaskConstructor, TaskFactory};
pub use task::{Task, optional_str};

//! Job queue port and its backends.
//!
//! - `traits`: the `JobQueue` contract, filters, stats and events
//! - `memory`: `InMemoryJobQueue`, a single-lock store for one process
//! - `libsql_backend`: `LibSqlJobQueue`, durable and statement-atomic
//! - `migrations`: versioned schema for the libSQL store

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlJobQueue;
pub use memory::InMemoryJobQueue;
pub use traits::{JobEvent, JobFilter, JobQueue, JobStats};

//! Worker system that turns leased jobs into recorded outcomes.
//!
//! - `worker`: one agent's lease → execute → complete/retry/fail loop
//! - `pool`: one independent worker loop per agent id, with shutdown

pub mod pool;
pub mod worker;

pub use pool::WorkerPool;
pub use worker::{JobOutcome, Worker};

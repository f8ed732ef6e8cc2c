//! Job data model.
//!
//! - `state`: status state machine (Waiting → Active → Completed/Failed)
//! - `attempts`: the immutable retry budget
//! - `backoff`: delay policies between attempts
//! - `model`: the `Job` entity, `JobName`, `JobSpec` and `StatusUpdate`

pub mod attempts;
pub mod backoff;
pub mod model;
pub mod state;

pub use attempts::{DEFAULT_MAX_ATTEMPTS, IncrementPolicy, JobAttempts};
pub use backoff::Backoff;
pub use model::{Job, JobName, JobSpec, LEASE_EXPIRED_ERROR, StatusUpdate};
pub use state::JobStatus;

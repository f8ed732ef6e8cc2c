//! Agent Jobs: lease-based job queue and task engine.

pub mod config;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod services;
pub mod tasks;
pub mod worker;

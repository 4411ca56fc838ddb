//! Signal dispatch service
//!
//! Receives trading alerts over signed webhooks, deduplicates them and turns
//! them into exchange orders through a durable, lane-based task queue.

pub mod application;
pub mod auth;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod secrets;
pub mod task_runner;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

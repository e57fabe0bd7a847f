//! Scheduler Module
//!
//! Drives the worker: polling, failure backoff and periodic health checks.

pub mod backoff;
pub mod health;
pub mod worker_loop;

pub use worker_loop::{WorkerLoop, WorkerState};

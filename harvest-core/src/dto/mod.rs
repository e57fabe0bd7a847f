//! Data transfer objects
//!
//! Shapes exchanged between the worker's services and the job store.

pub mod job;

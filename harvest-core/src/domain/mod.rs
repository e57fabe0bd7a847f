//! Core domain types
//!
//! These types represent the entities the worker moves through a job's
//! lifecycle. Persistence lives in the worker's store layer and execution
//! in `harvest-payload`; this module holds structure only.

pub mod context;
pub mod job;
pub mod metadata;
pub mod record;

//! Services Module
//!
//! The stages of job processing, leaf to root:
//! - [`claimer`]: claims the next eligible job
//! - [`context_builder`]: assembles the payload's execution context
//! - [`persister`]: writes scraped records in chunks
//! - [`reporter`]: intermediate and terminal job updates
//! - [`executor`]: runs the pipeline for one claimed job

pub mod claimer;
pub mod context_builder;
pub mod executor;
pub mod persister;
pub mod reporter;

pub use claimer::JobClaimer;
pub use executor::JobExecutor;
pub use reporter::{JobOutcome, StatusReporter};

//! Repository Module
//!
//! Data access layer for the worker. [`JobStore`] is the seam between the
//! services and the database; [`PgJobStore`] is the PostgreSQL implementation.

pub mod postgres;
pub mod store;

#[cfg(test)]
pub mod memory;

pub use postgres::PgJobStore;
pub use store::{JobStore, MAX_INSERT_BATCH, ScrapedProduct, StoreError};

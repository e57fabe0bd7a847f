//! Harvest Core
//!
//! Core types shared by the Harvest scraper worker and its tooling.
//!
//! This crate contains:
//! - Domain types: jobs, execution contexts, result records, output events
//! - DTOs: the shapes exchanged with the job store (job configuration, updates)

pub mod domain;
pub mod dto;

//! Harvest Payload
//!
//! Everything the worker and the CLI need to run an untrusted scraper payload
//! and make sense of what it printed:
//! - [`runner`]: sandboxed child-process execution with a wall-clock timeout
//! - [`parser`]: classification of stdout/stderr lines into output events
//! - [`metadata`]: the `<payload> metadata` query and dependency probing

pub mod metadata;
pub mod parser;
pub mod runner;

pub use metadata::{MetadataError, check_dependencies, parse_metadata, query_metadata};
pub use parser::{MalformedOutput, ParsedOutput, Verdict, parse_events, parse_progress};
pub use runner::{ProcessError, ProcessOutput, ProcessRunner, RunnerSettings};

//! Submission execution worker for an online judge.
//!
//! Workers claim submission IDs from a queue, build and run the submitted
//! program in a sandbox against the problem's test cases and persist the
//! verdict through a compare-and-set state store.

pub mod cancel;
pub mod compiler;
pub mod config;
pub mod core;
pub mod error;
pub mod jobs;
pub mod judger;
pub mod languages;
pub mod queue;
pub mod runner;
pub mod sandbox;
pub mod store;
pub mod worker;

pub use error::{Disposition, JudgeError};
pub use worker::WorkerContext;

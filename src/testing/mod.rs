//! Test runner
//!
//! Discovers test directories, runs their scripts against spawned or external
//! service instances and reports the outcome of every run.

mod config;
mod runner;

pub use config::*;
pub use runner::*;

//! rpctest - scripted conformance tests for JSON-RPC services
//!
//! Test scripts interleave `>>>` commands with the output they are expected
//! to produce. The harness spawns service instances, sends each command over
//! JSON-RPC and matches the reply against the script, collecting every
//! mismatch instead of stopping at the first.

pub mod cli;
pub mod commands;
pub mod common;
pub mod output;
pub mod process;
pub mod rpc;
pub mod script;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use script::{ExecutionContext, Interpreter};

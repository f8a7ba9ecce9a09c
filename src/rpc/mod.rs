//! JSON-RPC transport to the service under test

pub mod client;
pub mod protocol;

pub use client::{BackoffSchedule, CommandChannel, Endpoint, RpcClient};

//! Output matching and failure reporting

pub mod matcher;
pub mod report;

pub use matcher::{MatchOutcome, OutputState};
pub use report::MatchFailure;

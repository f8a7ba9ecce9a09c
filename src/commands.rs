//! CLI command definitions
//!
//! Defines the clap commands for the test harness CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run test directories (or directories of tests)
    Run {
        /// Test directories; a directory without testenv.yaml is searched for tests
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Configuration file (default: platform config dir)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Service executable to spawn
        #[arg(long)]
        client: Option<PathBuf>,

        /// Number of tests to run at once
        #[arg(long, short)]
        jobs: Option<usize>,

        /// Wall-clock limit per test, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Directory for data directories and transcripts
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print transcripts and debug logging
        #[arg(long, short)]
        verbose: bool,

        /// Also write a detailed log to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Print the token stream of a script with line and column
    Tokens {
        /// Script file
        script: PathBuf,
    },
}

//! CLI command handling
//!
//! Loads configuration, applies command-line overrides and hands off to the
//! runner or the lexer.

use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{logging, Error, Result};
use crate::script::lexer::tokenize;
use crate::testing::{self, TestCase};

/// Dispatch a CLI command; `Ok(false)` means tests ran and some failed
pub async fn dispatch(command: Commands) -> Result<bool> {
    match command {
        Commands::Run {
            paths,
            config,
            client,
            jobs,
            timeout,
            out,
            verbose,
            log_file,
        } => {
            // Held until the run ends so the file log is flushed
            let _guard = match &log_file {
                Some(path) => Some(logging::init_with_file(path, verbose)?),
                None => {
                    logging::init_cli(verbose);
                    None
                }
            };

            let mut config = match &config {
                Some(path) => Config::load_from(path)?,
                None => Config::load()?,
            };
            apply_overrides(&mut config, client, jobs, timeout, out)?;

            run(&paths, &config, verbose).await
        }

        Commands::Tokens { script } => {
            print_tokens(&script)?;
            Ok(true)
        }
    }
}

fn apply_overrides(
    config: &mut Config,
    client: Option<PathBuf>,
    jobs: Option<usize>,
    timeout: Option<u64>,
    out: Option<PathBuf>,
) -> Result<()> {
    if let Some(client) = client {
        config.service.executable = client;
    }
    if let Some(jobs) = jobs {
        if jobs == 0 {
            return Err(Error::Config("--jobs must be at least 1".to_string()));
        }
        config.runner.jobs = jobs;
    }
    if let Some(timeout) = timeout {
        config.timeouts.run_secs = timeout;
    }
    if let Some(out) = out {
        config.runner.out_dir = out;
    }
    Ok(())
}

async fn run(paths: &[PathBuf], config: &Config, verbose: bool) -> Result<bool> {
    let dirs = testing::discover(paths)?;
    if dirs.is_empty() {
        println!("{}", "No tests found".yellow());
        return Ok(true);
    }

    let cases = dirs
        .iter()
        .map(|dir| TestCase::load(dir))
        .collect::<Result<Vec<_>>>()?;

    println!(
        "{} {} test{} ({} at a time)",
        "Running".blue().bold(),
        cases.len(),
        if cases.len() == 1 { "" } else { "s" },
        config.runner.jobs.min(cases.len())
    );

    let reports = testing::run_batch(cases, config, verbose).await;
    Ok(testing::print_summary(&reports))
}

fn print_tokens(script: &Path) -> Result<()> {
    let src = std::fs::read_to_string(script).map_err(|e| Error::file_read(script, e))?;
    for token in tokenize(&src) {
        println!(
            "{:>4}:{:<4} {:<14} {:?}",
            token.line,
            token.column,
            format!("{:?}", token.kind()),
            token.text
        );
    }
    Ok(())
}

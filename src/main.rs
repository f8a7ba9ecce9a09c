//! rpctest - scripted conformance tests for JSON-RPC services
//!
//! Runs plain-text test scripts against spawned service instances and
//! reports every output mismatch.

use clap::Parser;
use rpctest::{cli, commands::Commands};

#[derive(Parser)]
#[command(name = "rpctest", about = "Scripted conformance tests for JSON-RPC services")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli::dispatch(cli.command).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
}

//! Mock JSON-RPC service for integration testing
//!
//! Accepts the same command-line flags the supervisor passes to the real
//! service and answers a small fixed command set over `POST /rpc`, so the
//! harness can be exercised end to end without the real binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use clap::Parser;
use rpctest::rpc::protocol::{Request, Response, RPC_PATH};
use serde_json::{json, Value};

const COMPILE_DATE: &str = "2014-06-20T14:13:00";

/// JSON-RPC error codes answered by the mock
const METHOD_NOT_FOUND: i64 = -32601;
const UNKNOWN_COMMAND: i64 = 20005;
const INVALID_PARAMS: i64 = -32602;

// Flags the real service takes are accepted even when the mock ignores them
#[allow(dead_code)]
#[derive(Parser, Debug)]
#[command(name = "mock_service", about = "JSON-RPC stand-in for the service under test")]
struct Args {
    #[arg(long = "p2p-port")]
    p2p_port: Option<u16>,

    #[arg(long)]
    rpcuser: String,

    #[arg(long)]
    rpcpassword: String,

    #[arg(long)]
    rpcport: u16,

    #[arg(long)]
    httpport: Option<u16>,

    #[arg(long = "disable-default-peers")]
    disable_default_peers: bool,

    #[arg(long = "disable-peer-advertising")]
    disable_peer_advertising: bool,

    #[arg(long = "min-delegate-connection-count")]
    min_delegate_connection_count: Option<u32>,

    #[arg(long)]
    upnp: Option<u8>,

    #[arg(long = "genesis-config")]
    genesis_config: Option<PathBuf>,

    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    server: bool,

    #[arg(long = "debug-stop")]
    debug_stop: bool,

    /// Keep running after SIGTERM so callers must escalate to SIGKILL
    #[arg(long = "ignore-sigterm")]
    ignore_sigterm: bool,
}

struct MockState {
    username: String,
    password: String,
    rpc_port: u16,
    p2p_port: Option<u16>,
    genesis: Option<PathBuf>,
    commands_run: Mutex<u64>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.ignore_sigterm {
        ignore_sigterm();
    }

    if let Some(dir) = &args.data_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("mock_service: cannot create data dir {}: {e}", dir.display());
            std::process::exit(1);
        }
    }

    let state = Arc::new(MockState {
        username: args.rpcuser.clone(),
        password: args.rpcpassword.clone(),
        rpc_port: args.rpcport,
        p2p_port: args.p2p_port,
        genesis: args.genesis_config.clone(),
        commands_run: Mutex::new(0),
    });

    let app = Router::new()
        .route(RPC_PATH, post(handle_rpc))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.rpcport));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("mock_service: cannot bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    println!("mock_service listening on {addr}");

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("mock_service: server error: {e}");
        std::process::exit(1);
    }
}

#[cfg(unix)]
fn ignore_sigterm() {
    // SAFETY: installing SIG_IGN has no handler code to race with
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigterm() {}

async fn handle_rpc(
    State(state): State<Arc<MockState>>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
    Json(request): Json<Request>,
) -> (StatusCode, Json<Response>) {
    let authorized = auth.is_some_and(|TypedHeader(Authorization(basic))| {
        basic.username() == state.username && basic.password() == state.password
    });
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(Response::failure(request.id, -32000, "unauthorized")),
        );
    }

    let result = match request.method.as_str() {
        "get_info" => Ok(info(&state)),
        "execute_command_line" => match request.params.first().and_then(Value::as_str) {
            Some(line) => execute(&state, line).await,
            None => Err((INVALID_PARAMS, "expected a command line string".to_string())),
        },
        other => Err((METHOD_NOT_FOUND, format!("method '{other}' not found"))),
    };

    match result {
        Ok(value) => (StatusCode::OK, Json(Response::success(request.id, value))),
        Err((code, message)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Response::failure(request.id, code, message)),
        ),
    }
}

fn info(state: &MockState) -> Value {
    let commands_run = state.commands_run.lock().map(|n| *n).unwrap_or(0);
    json!({
        "blockchain_head_block_num": 0,
        "network_num_connections": 0,
        "rpc_port": state.rpc_port,
        "p2p_port": state.p2p_port,
        "genesis": state.genesis.as_ref().map(|p| p.display().to_string()),
        "commands_run": commands_run,
    })
}

async fn execute(state: &MockState, line: &str) -> Result<Value, (i64, String)> {
    if let Ok(mut n) = state.commands_run.lock() {
        *n += 1;
    }

    let line = line.trim();
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "get_info" => Ok(info(state)),
        "echo" => Ok(Value::String(rest.to_string())),
        "about" => Ok(json!({
            "client_version": "mock-0.1.0",
            "compile_date": COMPILE_DATE,
            "started": "3 seconds ago",
        })),
        "help" => Ok(Value::String(
            "about\nbalance\necho TEXT\nget_info\nhelp\nsleep SECONDS".to_string(),
        )),
        // Exact decimal that an f64 round trip would corrupt
        "balance" => serde_json::from_str::<Value>("{\"amount\": 10000000000.000000000001, \"symbol\": \"XTS\"}")
            .map_err(|e| (UNKNOWN_COMMAND, e.to_string())),
        "sleep" => {
            let secs = rest
                .parse::<u64>()
                .map_err(|e| (INVALID_PARAMS, format!("bad duration '{rest}': {e}")))?;
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            Ok(Value::Null)
        }
        other => Err((UNKNOWN_COMMAND, format!("unknown command '{other}'"))),
    }
}

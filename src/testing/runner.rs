//! Test runner implementation
//!
//! A test is a directory with a `testenv.yaml` and one or more scripts. A run
//! spawns the declared clients, waits for them to answer RPC, executes the
//! scripts in filename order and always tears the clients down again, however
//! the run ended. Independent tests run concurrently, each with its own port
//! range, cancellation token and wall-clock limit.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use colored::Colorize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::common::config::Config;
use crate::common::{paths, Error, Result};
use crate::output::{report, MatchFailure};
use crate::process::{LaunchSpec, PortAllocator, ProcessHandle, ServicePorts};
use crate::rpc::{BackoffSchedule, CommandChannel, Endpoint, RpcClient};
use crate::script::{Client, ExecutionContext, Interpreter};

use super::config::{ClientConfig, TestEnv, TESTENV_FILE};

/// Extra time a run gets past its limit to finish tearing down
const TEARDOWN_CAP: Duration = Duration::from_secs(30);

/// Marker file that keeps a work-in-progress test out of batch runs
const WIP_MARKER: &str = "wip";

/// Transcript file written into each test's output directory
pub const TRANSCRIPT_FILE: &str = "transcript.txt";

/// A test directory with its parsed environment
#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: String,
    pub dir: PathBuf,
    pub env: TestEnv,
}

impl TestCase {
    pub fn load(dir: &Path) -> Result<Self> {
        let env = TestEnv::load(dir)?;
        let name = env.name.clone().unwrap_or_else(|| {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "test".to_string())
        });
        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            env,
        })
    }
}

/// How a run ended
#[derive(Debug)]
pub enum Outcome {
    Passed,
    /// Completed with mismatches
    Failed(Vec<MatchFailure>),
    /// Stopped by a fatal error
    Aborted(Error),
    TimedOut,
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Passed)
    }
}

/// Result of one test run
#[derive(Debug)]
pub struct RunReport {
    pub name: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
    pub transcript: String,
    /// Where the transcript was saved, if writing it succeeded
    pub transcript_path: Option<PathBuf>,
}

/// Find test directories under `paths`
///
/// A path holding `testenv.yaml` is a test itself; otherwise its immediate
/// subdirectories are searched. Directories starting with `_` or `.`, and
/// those containing a `wip` marker, are skipped.
pub fn discover(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for path in paths {
        if path.join(TESTENV_FILE).is_file() {
            found.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            return Err(Error::Config(format!(
                "'{}' is neither a test nor a directory of tests",
                path.display()
            )));
        }

        let mut tests = Vec::new();
        for entry in std::fs::read_dir(path).map_err(|e| Error::file_read(path, e))? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let name = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if name.starts_with('_') || name.starts_with('.') {
                tracing::debug!(test = %name, "skipping hidden test directory");
                continue;
            }
            if !dir.join(TESTENV_FILE).is_file() {
                continue;
            }
            if dir.join(WIP_MARKER).exists() {
                tracing::info!(test = %name, "skipping work-in-progress test");
                continue;
            }
            tests.push(dir);
        }
        tests.sort();
        found.extend(tests);
    }
    Ok(found)
}

/// Run one test to completion, tearing down every spawned client
///
/// Setup and scripts run under the `timeouts.run_secs` limit. When it passes,
/// `cancel` is fired and the run ends as `TimedOut`. Teardown happens after
/// the outcome is settled and never turns a finished run into a timeout.
pub async fn run_case(
    case: &TestCase,
    config: &Config,
    mut ports: PortAllocator,
    cancel: CancellationToken,
    echo: bool,
) -> RunReport {
    let started = Instant::now();
    let test_dir = paths::test_out_dir(&config.runner.out_dir, &case.name);
    tracing::info!(test = %case.name, dir = %case.dir.display(), "starting test");

    let mut ctx = ExecutionContext::default();
    ctx.transcript.echo = echo;

    let (result, timed_out) = {
        let script = async {
            setup(case, config, &mut ports, &cancel, &test_dir, &mut ctx).await?;
            Interpreter::new(&mut ctx)
                .run_dir(&case.dir, &config.runner.script_extension)
                .await
        };
        tokio::pin!(script);

        let limit = tokio::time::sleep(config.timeouts.run());
        tokio::pin!(limit);

        let mut timed_out = false;
        let result = loop {
            tokio::select! {
                result = &mut script => break result,
                _ = &mut limit, if !timed_out => {
                    tracing::warn!(test = %case.name, limit = ?config.timeouts.run(), "test timed out, cancelling");
                    timed_out = true;
                    cancel.cancel();
                }
            }
        };
        (result, timed_out)
    };

    let outcome = match result {
        _ if timed_out => Outcome::TimedOut,
        Ok(0) => Outcome::Aborted(Error::Config(format!(
            "no .{} scripts in '{}'",
            config.runner.script_extension,
            case.dir.display()
        ))),
        Ok(_) if ctx.failures.is_empty() => Outcome::Passed,
        Ok(_) => Outcome::Failed(std::mem::take(&mut ctx.failures)),
        Err(e) if e.is_cancelled() => Outcome::TimedOut,
        Err(e) => Outcome::Aborted(e),
    };

    if let Err(e) = ctx.shutdown().await {
        tracing::warn!(test = %case.name, error = %e, "teardown incomplete");
    }

    let transcript = ctx.transcript.as_str().to_string();
    let transcript_path = save_transcript(&test_dir, &transcript);

    RunReport {
        name: case.name.clone(),
        outcome,
        elapsed: started.elapsed(),
        transcript,
        transcript_path,
    }
}

/// Run one test with its own cancellation token
///
/// The run limit is enforced inside [`run_case`]; this adds an outer bound so
/// a teardown that never finishes cannot stall the batch.
pub async fn run_with_timeout(
    case: &TestCase,
    config: &Config,
    ports: PortAllocator,
    echo: bool,
) -> RunReport {
    let cancel = CancellationToken::new();
    let bound = config.timeouts.run() + TEARDOWN_CAP;

    match tokio::time::timeout(bound, run_case(case, config, ports, cancel.clone(), echo)).await {
        Ok(report) => report,
        Err(_) => {
            cancel.cancel();
            tracing::error!(test = %case.name, "teardown did not finish in time");
            RunReport {
                name: case.name.clone(),
                outcome: Outcome::TimedOut,
                elapsed: bound,
                transcript: String::new(),
                transcript_path: None,
            }
        }
    }
}

/// Run tests concurrently, at most `runner.jobs` at a time
///
/// Reports come back sorted by test name.
pub async fn run_batch(cases: Vec<TestCase>, config: &Config, verbose: bool) -> Vec<RunReport> {
    let jobs = config.runner.jobs.clamp(1, cases.len().max(1));
    let echo = verbose && jobs == 1;
    let config = Arc::new(config.clone());
    let semaphore = Arc::new(Semaphore::new(jobs));
    // Each slot owns one disjoint slice of the port range
    let slots = Arc::new(Mutex::new((0..jobs).rev().collect::<Vec<_>>()));

    let mut set = JoinSet::new();
    for case in cases {
        let config = Arc::clone(&config);
        let semaphore = Arc::clone(&semaphore);
        let slots = Arc::clone(&slots);

        set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    return RunReport {
                        name: case.name.clone(),
                        outcome: Outcome::Aborted(Error::Internal(e.to_string())),
                        elapsed: Duration::ZERO,
                        transcript: String::new(),
                        transcript_path: None,
                    }
                }
            };
            let slot = slots.lock().ok().and_then(|mut s| s.pop()).unwrap_or(0);
            let report = match PortAllocator::slice(&config.ports, slot, jobs) {
                Ok(ports) => run_with_timeout(&case, &config, ports, echo).await,
                Err(e) => RunReport {
                    name: case.name.clone(),
                    outcome: Outcome::Aborted(e),
                    elapsed: Duration::ZERO,
                    transcript: String::new(),
                    transcript_path: None,
                },
            };

            if let Ok(mut s) = slots.lock() {
                s.push(slot);
            }
            print_run(&report, verbose && !echo);
            report
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => tracing::error!(error = %e, "test task failed"),
        }
    }
    reports.sort_by(|a, b| a.name.cmp(&b.name));
    reports
}

/// Spawn or connect every declared client and seed the run's variables
async fn setup(
    case: &TestCase,
    config: &Config,
    ports: &mut PortAllocator,
    cancel: &CancellationToken,
    test_dir: &Path,
    ctx: &mut ExecutionContext,
) -> Result<()> {
    std::fs::create_dir_all(test_dir)?;
    ctx.vars = case.env.seed_vars()?;
    ctx.vars.set("testname", case.name.clone());
    ctx.vars.set("test_dir", test_dir.display().to_string());

    let schedule = BackoffSchedule::with_ceiling(Duration::from_secs(
        config.timeouts.ready_ceiling_secs,
    ));

    for client_config in &case.env.clients {
        let name = client_config.name.clone();
        let client = if client_config.spawn {
            spawn_client(case, config, client_config, ports, cancel, test_dir)?
        } else {
            connect_client(config, client_config, cancel)?
        };

        if let Some(process) = &client.process {
            let ports = process.ports();
            ctx.vars.set(format!("{name}_rpc_port"), i64::from(ports.rpc));
            ctx.vars.set(format!("{name}_p2p_port"), i64::from(ports.p2p));
            ctx.vars.set(format!("{name}_http_port"), i64::from(ports.http));
        } else if let Some(port) = client_config.rpc_port {
            ctx.vars.set(format!("{name}_rpc_port"), i64::from(port));
        }

        // Registered before the readiness wait so teardown always covers it
        ctx.register_client(client);
        let client = ctx.client_mut(&name)?;
        if let Some(process) = client.process.as_mut() {
            tokio::select! {
                ready = client.channel.ready(&schedule) => ready?,
                exited = process.exit_error() => return Err(exited),
            }
        }
    }

    if let Some(active) = &case.env.active {
        ctx.active_client = Some(active.clone());
    }
    Ok(())
}

fn endpoint(config: &Config, client_config: &ClientConfig, host: String, port: u16) -> Endpoint {
    Endpoint {
        host,
        port,
        username: client_config
            .username
            .clone()
            .unwrap_or_else(|| config.service.username.clone()),
        password: client_config
            .password
            .clone()
            .unwrap_or_else(|| config.service.password.clone()),
    }
}

fn spawn_client(
    case: &TestCase,
    config: &Config,
    client_config: &ClientConfig,
    ports: &mut PortAllocator,
    cancel: &CancellationToken,
    test_dir: &Path,
) -> Result<Client> {
    let mut pick = |pinned: Option<u16>| -> Result<u16> {
        match pinned {
            Some(port) => Ok(port),
            None => ports.next_port(),
        }
    };
    let service_ports = ServicePorts {
        p2p: pick(client_config.p2p_port)?,
        rpc: pick(client_config.rpc_port)?,
        http: pick(client_config.http_port)?,
    };

    let executable = match &client_config.executable {
        Some(exe) => case.dir.join(exe),
        None => config.resolve_executable()?,
    };
    let genesis = match &client_config.genesis {
        Some(genesis) => Some(case.dir.join(genesis)),
        None => config.service.genesis.clone(),
    };

    let data_dir = test_dir.join(&client_config.name);
    if data_dir.exists() {
        std::fs::remove_dir_all(&data_dir)?;
    }

    let endpoint = endpoint(
        config,
        client_config,
        config.service.host.clone(),
        service_ports.rpc,
    );
    let spec = LaunchSpec {
        name: client_config.name.clone(),
        executable,
        data_dir,
        pid_file: paths::pid_file(test_dir, &client_config.name),
        ports: service_ports,
        username: endpoint.username.clone(),
        password: endpoint.password.clone(),
        genesis,
        address_prefix: config.service.address_prefix.clone(),
        known_prefixes: config.service.known_prefixes.clone(),
        debug_stop: client_config.debug_stop,
        extra_args: config.service.extra_args.clone(),
        stop_grace: config.timeouts.stop_grace(),
    };

    let mut process = ProcessHandle::new(spec);
    process.start()?;

    let rpc = RpcClient::new(endpoint, config.timeouts.rpc_request(), cancel.clone())?;
    Ok(Client::new(client_config.name.clone(), Box::new(rpc)).with_process(process))
}

fn connect_client(
    config: &Config,
    client_config: &ClientConfig,
    cancel: &CancellationToken,
) -> Result<Client> {
    let port = client_config.rpc_port.ok_or_else(|| {
        Error::Config(format!(
            "external client '{}' needs an rpc_port",
            client_config.name
        ))
    })?;
    let host = client_config
        .host
        .clone()
        .unwrap_or_else(|| config.service.host.clone());
    let endpoint = endpoint(config, client_config, host, port);
    let rpc = RpcClient::new(endpoint, config.timeouts.rpc_request(), cancel.clone())?;
    Ok(Client::new(client_config.name.clone(), Box::new(rpc)))
}

fn save_transcript(test_dir: &Path, transcript: &str) -> Option<PathBuf> {
    let path = test_dir.join(TRANSCRIPT_FILE);
    let written = std::fs::create_dir_all(test_dir).and_then(|()| std::fs::write(&path, transcript));
    match written {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to write transcript");
            None
        }
    }
}

/// Print the result line of one run as it completes
pub fn print_run(report: &RunReport, show_transcript: bool) {
    if show_transcript && !report.transcript.is_empty() {
        println!("\n{}", format!("--- {} ---", report.name).dimmed());
        print!("{}", report.transcript);
    }

    let elapsed = format!("({:.1}s)", report.elapsed.as_secs_f64()).dimmed();
    match &report.outcome {
        Outcome::Passed => println!("{} {} {}", "✓".green(), report.name, elapsed),
        Outcome::Failed(failures) => println!(
            "{} {} {}: {}",
            "✗".red(),
            report.name,
            elapsed,
            report::summary(failures).red()
        ),
        Outcome::Aborted(e) => println!("{} {} {}: {}", "✗".red(), report.name, elapsed, e),
        Outcome::TimedOut => println!(
            "{} {} {}",
            "⏱".yellow(),
            report.name,
            "timed out".yellow()
        ),
    }
}

/// Print the failure details and totals; true if every run passed
pub fn print_summary(reports: &[RunReport]) -> bool {
    let mut passed = 0;
    for report in reports {
        match &report.outcome {
            Outcome::Passed => passed += 1,
            Outcome::Failed(failures) => {
                println!("\n{} {}", "Mismatches in".red().bold(), report.name.white().bold());
                print!("{}", report::render(failures));
                if let Some(path) = &report.transcript_path {
                    println!("  {} {}", "Transcript:".dimmed(), path.display());
                }
            }
            Outcome::Aborted(e) => {
                println!("\n{} {}", "Aborted".red().bold(), report.name.white().bold());
                println!("  {e}");
                let mut source = std::error::Error::source(e);
                while let Some(cause) = source {
                    println!("  {} {cause}", "caused by:".dimmed());
                    source = std::error::Error::source(cause);
                }
            }
            Outcome::TimedOut => {}
        }
    }

    let failed = reports.len() - passed;
    let totals = format!("{passed} passed, {failed} failed");
    if failed == 0 {
        println!("\n{} {}", "✓".green().bold(), totals.green().bold());
    } else {
        println!("\n{} {}", "✗".red().bold(), totals.red().bold());
    }
    failed == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test(root: &Path, name: &str, testenv: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(TESTENV_FILE), testenv).unwrap();
        dir
    }

    #[test]
    fn test_discover_applies_skip_rules() {
        let root = tempfile::tempdir().unwrap();
        make_test(root.path(), "b_transfer", "clients: []");
        make_test(root.path(), "a_info", "clients: []");
        make_test(root.path(), "_disabled", "clients: []");
        make_test(root.path(), ".hidden", "clients: []");
        let wip = make_test(root.path(), "c_wip", "clients: []");
        std::fs::write(wip.join(WIP_MARKER), "").unwrap();
        std::fs::create_dir_all(root.path().join("not_a_test")).unwrap();

        let found = discover(&[root.path().to_path_buf()]).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_info", "b_transfer"]);

        let single = discover(&[root.path().join("c_wip")]).unwrap();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn test_case_name_defaults_to_directory() {
        let root = tempfile::tempdir().unwrap();
        let named = make_test(root.path(), "dir_name", "name: custom\nclients: []");
        let unnamed = make_test(root.path(), "plain", "clients: []");
        assert_eq!(TestCase::load(&named).unwrap().name, "custom");
        assert_eq!(TestCase::load(&unnamed).unwrap().name, "plain");
    }

    #[tokio::test]
    async fn test_unreachable_external_client_aborts() {
        let root = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = make_test(
            root.path(),
            "offline",
            &format!("clients:\n  - name: remote\n    spawn: false\n    rpc_port: {port}\n"),
        );
        std::fs::write(dir.join("01.btstest"), ">>> get_info\n").unwrap();

        let mut config = Config::default();
        config.runner.out_dir = root.path().join("out");
        config.timeouts.rpc_request_secs = 1;

        let case = TestCase::load(&dir).unwrap();
        let report = run_case(
            &case,
            &config,
            PortAllocator::new(40000, 40010),
            CancellationToken::new(),
            false,
        )
        .await;
        assert!(matches!(
            report.outcome,
            Outcome::Aborted(Error::Command { .. })
        ));
        assert!(root.path().join("out/offline").join(TRANSCRIPT_FILE).exists());
    }
}

//! Service process lifecycle
//!
//! A [`ProcessHandle`] owns one spawned service instance: its data directory,
//! its ports, the stdout/stderr capture files and the pid file. `stop` is safe
//! to call any number of times and on a process that already exited.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

use crate::common::{Error, Result};

use super::genesis;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";

/// Ports one instance listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePorts {
    pub p2p: u16,
    pub rpc: u16,
    pub http: u16,
}

/// Everything needed to launch one instance
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Logical client name, used in logs and for the pid file
    pub name: String,
    pub executable: PathBuf,
    pub data_dir: PathBuf,
    pub pid_file: PathBuf,
    pub ports: ServicePorts,
    pub username: String,
    pub password: String,
    /// Base genesis the instance's copy is derived from
    pub genesis: Option<PathBuf>,
    pub address_prefix: String,
    pub known_prefixes: Vec<String>,
    /// Ask the service to halt at startup for a debugger
    pub debug_stop: bool,
    pub extra_args: Vec<String>,
    /// Wait per stop phase before escalating
    pub stop_grace: Duration,
}

impl LaunchSpec {
    /// Command-line flags for the service
    pub fn args(&self, genesis_path: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "--p2p-port".to_string(),
            self.ports.p2p.to_string(),
            "--rpcuser".to_string(),
            self.username.clone(),
            "--rpcpassword".to_string(),
            self.password.clone(),
            "--rpcport".to_string(),
            self.ports.rpc.to_string(),
            "--httpport".to_string(),
            self.ports.http.to_string(),
            "--disable-default-peers".to_string(),
            "--disable-peer-advertising".to_string(),
            "--min-delegate-connection-count".to_string(),
            "0".to_string(),
            "--upnp".to_string(),
            "0".to_string(),
        ];
        if let Some(path) = genesis_path {
            args.push("--genesis-config".to_string());
            args.push(path.display().to_string());
        }
        args.push("--data-dir".to_string());
        args.push(self.data_dir.display().to_string());
        args.push("--server".to_string());
        if self.debug_stop {
            args.push("--debug-stop".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// A supervised service instance
pub struct ProcessHandle {
    spec: LaunchSpec,
    child: Option<Child>,
    pid: Option<u32>,
}

impl ProcessHandle {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            child: None,
            pid: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn ports(&self) -> ServicePorts {
        self.spec.ports
    }

    pub fn data_dir(&self) -> &Path {
        &self.spec.data_dir
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process was started and has not exited yet
    pub fn is_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Wait for the process to exit and describe it as a startup failure
    ///
    /// Never resolves when nothing was started, so it can be raced against a
    /// readiness wait.
    pub async fn exit_error(&mut self) -> Error {
        let Some(child) = self.child.as_mut() else {
            return std::future::pending().await;
        };
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.to_string(),
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => break e.to_string(),
            }
        };
        Error::ProcessStart(format!(
            "'{}' exited before answering RPC ({status}), see {}",
            self.name(),
            self.data_dir().join(STDERR_FILE).display()
        ))
    }

    /// Prepare the data directory and launch the service
    pub fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(Error::AlreadyStarted(self.spec.name.clone()));
        }

        let spec = &self.spec;
        std::fs::create_dir_all(&spec.data_dir)?;

        let genesis_path = match &spec.genesis {
            Some(base) => Some(genesis::write_genesis(
                base,
                &spec.data_dir,
                &spec.address_prefix,
                &spec.known_prefixes,
            )?),
            None => None,
        };
        genesis::write_checkpoints(&spec.data_dir)?;

        let stdout = File::create(spec.data_dir.join(STDOUT_FILE))?;
        let stderr = File::create(spec.data_dir.join(STDERR_FILE))?;
        let args = spec.args(genesis_path.as_deref());

        tracing::debug!(name = %spec.name, executable = %spec.executable.display(), ?args, "spawning service");
        let child = Command::new(&spec.executable)
            .args(&args)
            .current_dir(&spec.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ProcessStart(format!(
                    "{} ({}): {}",
                    spec.name,
                    spec.executable.display(),
                    e
                ))
            })?;

        let pid = child.id();
        if let Some(pid) = pid {
            if let Some(dir) = spec.pid_file.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&spec.pid_file, format!("{pid}\n"))?;
        }

        tracing::info!(
            name = %spec.name,
            pid,
            rpc_port = spec.ports.rpc,
            p2p_port = spec.ports.p2p,
            "service started"
        );
        self.pid = pid;
        self.child = Some(child);
        Ok(())
    }

    /// Terminate the service, escalating to a kill if it lingers
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            self.remove_pid_file();
            return Ok(());
        };

        if matches!(child.try_wait(), Ok(None)) {
            terminate(&mut child);
            if !wait_for_exit(&mut child, self.spec.stop_grace).await {
                tracing::warn!(name = %self.spec.name, "service ignored terminate signal, killing");
                let _ = child.start_kill();
                if !wait_for_exit(&mut child, self.spec.stop_grace).await {
                    tracing::warn!(name = %self.spec.name, pid = self.pid, "service did not exit after kill");
                }
            }
        }

        tracing::info!(name = %self.spec.name, pid = self.pid, "service stopped");
        self.remove_pid_file();
        Ok(())
    }

    fn remove_pid_file(&self) {
        match std::fs::remove_file(&self.spec.pid_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.spec.pid_file.display(), error = %e, "failed to remove pid file"),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Best-effort: stop() should already have run
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
            self.remove_pid_file();
        }
    }
}

/// Ask the process to exit
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to a pid we spawned and have not reaped
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }
    }
    let _ = child.start_kill();
}

/// Poll until the child exits or `grace` elapses; true if it exited
async fn wait_for_exit(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if !matches!(child.try_wait(), Ok(None)) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL.min(grace)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path, executable: PathBuf) -> LaunchSpec {
        LaunchSpec {
            name: "alice".to_string(),
            executable,
            data_dir: dir.join("alice"),
            pid_file: dir.join("alice.pid"),
            ports: ServicePorts {
                p2p: 30001,
                rpc: 30002,
                http: 30003,
            },
            username: "username".to_string(),
            password: "password".to_string(),
            genesis: None,
            address_prefix: "XTS".to_string(),
            known_prefixes: vec!["BTS".to_string()],
            debug_stop: false,
            extra_args: Vec::new(),
            stop_grace: Duration::from_millis(500),
        }
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("service.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_args_follow_service_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec(dir.path(), PathBuf::from("svc"));
        spec.debug_stop = true;
        spec.extra_args = vec!["--log-commands".to_string()];

        let args = spec.args(Some(Path::new("/tmp/g.json")));
        let joined = args.join(" ");
        assert!(joined.starts_with("--p2p-port 30001 --rpcuser username --rpcpassword password --rpcport 30002 --httpport 30003"));
        assert!(joined.contains("--min-delegate-connection-count 0 --upnp 0 --genesis-config /tmp/g.json --data-dir"));
        assert!(joined.ends_with("--server --debug-stop --log-commands"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_start_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = ProcessHandle::new(spec(dir.path(), dir.path().join("no-such-binary")));
        assert!(matches!(handle.start(), Err(Error::ProcessStart(_))));
        assert!(!dir.path().join("alice.pid").exists());
        handle.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_error_reports_status_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo 'bind failed' >&2\nexit 3");
        let mut handle = ProcessHandle::new(spec(dir.path(), exe));
        handle.start().unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), handle.exit_error())
            .await
            .unwrap();
        let message = match err {
            Error::ProcessStart(message) => message,
            other => panic!("unexpected error {other:?}"),
        };
        assert!(message.contains("exit status: 3"), "{message}");
        assert!(message.contains(STDERR_FILE), "{message}");
        assert!(!handle.is_running());
        handle.stop().await.unwrap();
        assert!(!dir.path().join("alice.pid").exists());
    }

    #[tokio::test]
    async fn test_exit_error_waits_forever_when_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = ProcessHandle::new(spec(dir.path(), PathBuf::from("svc")));
        let waited = tokio::time::timeout(Duration::from_millis(100), handle.exit_error()).await;
        assert!(waited.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_writes_artifacts_and_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo started\nexec sleep 30");
        let mut handle = ProcessHandle::new(spec(dir.path(), exe));

        handle.start().unwrap();
        assert!(handle.is_running());
        assert!(matches!(handle.start(), Err(Error::AlreadyStarted(_))));

        let pid_file = dir.path().join("alice.pid");
        let recorded: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert_eq!(Some(recorded), handle.pid());
        assert!(dir.path().join("alice").join(genesis::CHECKPOINTS_FILE).exists());

        handle.stop().await.unwrap();
        assert!(!handle.is_running());
        assert!(!pid_file.exists());
        assert!(dir.path().join("alice").join(STDOUT_FILE).exists());

        handle.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_when_terminate_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "trap '' TERM\nexec sleep 30");
        let mut handle = ProcessHandle::new(spec(dir.path(), exe));
        handle.start().unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        handle.stop().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(!handle.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_after_exit_only_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "exit 0");
        let mut handle = ProcessHandle::new(spec(dir.path(), exe));
        handle.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        handle.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!dir.path().join("alice.pid").exists());
    }
}

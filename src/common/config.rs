//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// How to launch and reach the service under test
    #[serde(default)]
    pub service: ServiceConfig,

    /// Port range handed out to spawned instances
    #[serde(default)]
    pub ports: PortsConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Batch runner settings
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Service executable and credentials
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Path (or PATH-resolvable name) of the service executable
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Address the RPC client connects to
    #[serde(default = "default_host")]
    pub host: String,

    /// RPC basic-auth user
    #[serde(default = "default_username")]
    pub username: String,

    /// RPC basic-auth password
    #[serde(default = "default_password")]
    pub password: String,

    /// Base genesis configuration the per-instance copy is derived from
    #[serde(default)]
    pub genesis: Option<PathBuf>,

    /// Address prefix used by the test network
    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,

    /// Prefixes rewritten to `address_prefix` in the derived genesis
    #[serde(default = "default_known_prefixes")]
    pub known_prefixes: Vec<String>,

    /// Additional flags appended to every launch
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            host: default_host(),
            username: default_username(),
            password: default_password(),
            genesis: None,
            address_prefix: default_address_prefix(),
            known_prefixes: default_known_prefixes(),
            extra_args: Vec::new(),
        }
    }
}

fn default_executable() -> PathBuf {
    PathBuf::from("bitsharestestnet_client")
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_username() -> String {
    "username".to_string()
}
fn default_password() -> String {
    "password".to_string()
}
fn default_address_prefix() -> String {
    "XTS".to_string()
}
fn default_known_prefixes() -> Vec<String> {
    ["XTS", "DVS", "BTS"].iter().map(|s| s.to_string()).collect()
}

/// Port allocation range `[min, max)`
#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    #[serde(default = "default_min_port")]
    pub min: u16,

    #[serde(default = "default_max_port")]
    pub max: u16,

    /// Skip ports the OS reports as listening
    #[serde(default = "default_probe_os")]
    pub probe_os: bool,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: default_min_port(),
            max: default_max_port(),
            probe_os: default_probe_os(),
        }
    }
}

fn default_min_port() -> u16 {
    30000
}
fn default_max_port() -> u16 {
    40000
}
fn default_probe_os() -> bool {
    true
}

/// Timeout settings
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Timeout for a single RPC request
    #[serde(default = "default_rpc_request")]
    pub rpc_request_secs: u64,

    /// Give up waiting for a spawned service after this long
    #[serde(default = "default_ready_ceiling")]
    pub ready_ceiling_secs: u64,

    /// Wall-clock limit for one test run
    #[serde(default = "default_run")]
    pub run_secs: u64,

    /// How long each stop phase (terminate, then kill) waits for exit
    #[serde(default = "default_stop_grace")]
    pub stop_grace_millis: u64,
}

impl Timeouts {
    pub fn rpc_request(&self) -> Duration {
        Duration::from_secs(self.rpc_request_secs)
    }

    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_millis)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            rpc_request_secs: default_rpc_request(),
            ready_ceiling_secs: default_ready_ceiling(),
            run_secs: default_run(),
            stop_grace_millis: default_stop_grace(),
        }
    }
}

fn default_rpc_request() -> u64 {
    60
}
fn default_ready_ceiling() -> u64 {
    300
}
fn default_run() -> u64 {
    300
}
fn default_stop_grace() -> u64 {
    3000
}

/// Batch runner settings
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Maximum number of tests running at once
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Extension of script files inside a test directory
    #[serde(default = "default_script_extension")]
    pub script_extension: String,

    /// Root of per-test data directories and transcripts
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            script_extension: default_script_extension(),
            out_dir: default_out_dir(),
        }
    }
}

fn default_jobs() -> usize {
    8
}
fn default_script_extension() -> String {
    "btstest".to_string()
}
fn default_out_dir() -> PathBuf {
    PathBuf::from("btstests").join("out")
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| super::Error::file_read(path, e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ports.min >= self.ports.max {
            return Err(super::Error::Config(format!(
                "ports.min ({}) must be below ports.max ({})",
                self.ports.min, self.ports.max
            )));
        }
        if self.runner.jobs == 0 {
            return Err(super::Error::Config("runner.jobs must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Resolve the service executable
    ///
    /// Bare names are looked up in PATH; paths are used as given.
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        let exe = &self.service.executable;
        if exe.components().count() > 1 || exe.is_absolute() {
            return Ok(exe.clone());
        }
        which::which(exe).map_err(|e| {
            super::Error::ProcessStart(format!(
                "service executable '{}' not found in PATH: {}",
                exe.display(),
                e
            ))
        })
    }
}

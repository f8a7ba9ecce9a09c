//! Test environment files
//!
//! Every test directory holds a `testenv.yaml` describing the clients the
//! test needs and the variables its scripts start with.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};
use crate::script::expr::{Env, Value};

/// File name of a test's environment description
pub const TESTENV_FILE: &str = "testenv.yaml";

/// A test environment loaded from `testenv.yaml`
#[derive(Deserialize, Debug, Default, Clone)]
pub struct TestEnv {
    /// Test name; defaults to the directory name
    pub name: Option<String>,
    /// Variables seeded into the script environment
    #[serde(default)]
    pub vars: BTreeMap<String, serde_yaml::Value>,
    /// Clients to register, in order
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    /// Initially active client; defaults to the first one
    pub active: Option<String>,
}

/// One client of a test
#[derive(Deserialize, Debug, Clone)]
pub struct ClientConfig {
    /// Name used by `!client` and in variable names
    pub name: String,
    /// Launch a service instance for this client (default: true)
    #[serde(default = "default_spawn")]
    pub spawn: bool,
    /// Host of an external instance; defaults to the configured host
    pub host: Option<String>,
    /// Pinned ports; unset ports are allocated
    pub rpc_port: Option<u16>,
    pub p2p_port: Option<u16>,
    pub http_port: Option<u16>,
    /// Credential overrides
    pub username: Option<String>,
    pub password: Option<String>,
    /// Base genesis for this client, relative to the test directory
    pub genesis: Option<PathBuf>,
    /// Executable override, relative to the test directory
    pub executable: Option<PathBuf>,
    /// Start the service halted for a debugger
    #[serde(default)]
    pub debug_stop: bool,
}

fn default_spawn() -> bool {
    true
}

impl TestEnv {
    /// Load `testenv.yaml` from a test directory
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(TESTENV_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| Error::file_read(&path, e))?;
        let env: TestEnv = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse '{}': {}", path.display(), e)))?;
        env.validate()?;
        Ok(env)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            if !seen.insert(client.name.as_str()) {
                return Err(Error::Config(format!(
                    "client '{}' is declared twice",
                    client.name
                )));
            }
            if !client.spawn && client.rpc_port.is_none() {
                return Err(Error::Config(format!(
                    "external client '{}' needs an rpc_port",
                    client.name
                )));
            }
        }
        if let Some(active) = &self.active {
            if !seen.contains(active.as_str()) {
                return Err(Error::Config(format!(
                    "active client '{active}' is not declared"
                )));
            }
        }
        Ok(())
    }

    /// Script environment holding the declared variables
    pub fn seed_vars(&self) -> Result<Env> {
        let mut env = Env::new();
        for (name, value) in &self.vars {
            env.set(name.clone(), yaml_to_value(value)?);
        }
        Ok(env)
    }
}

fn yaml_to_value(value: &serde_yaml::Value) -> Result<Value> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(*b),
        serde_yaml::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Str(n.to_string()),
        },
        serde_yaml::Value::String(s) => Value::Str(s.clone()),
        other => Value::Json(serde_json::to_value(other)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_testenv() {
        let env: TestEnv = serde_yaml::from_str(
            r#"
name: transfer
vars:
  amount: 100
  memo: "rent"
  fee: 0.5
  accounts: [alice, bob]
clients:
  - name: alice
    debug_stop: true
  - name: remote
    spawn: false
    host: 10.0.0.2
    rpc_port: 5680
active: remote
"#,
        )
        .unwrap();
        env.validate().unwrap();

        assert_eq!(env.name.as_deref(), Some("transfer"));
        assert!(env.clients[0].spawn);
        assert!(env.clients[0].debug_stop);
        assert!(!env.clients[1].spawn);
        assert_eq!(env.clients[1].rpc_port, Some(5680));

        let vars = env.seed_vars().unwrap();
        assert_eq!(vars.get("amount"), Some(&Value::Int(100)));
        assert_eq!(vars.get("memo"), Some(&Value::from("rent")));
        assert_eq!(vars.get("fee"), Some(&Value::from("0.5")));
        assert_eq!(
            vars.get("accounts"),
            Some(&Value::Json(serde_json::json!(["alice", "bob"])))
        );
    }

    #[test]
    fn test_invalid_testenvs_rejected() {
        let dup: TestEnv =
            serde_yaml::from_str("clients: [{name: a}, {name: a}]").unwrap();
        assert!(dup.validate().is_err());

        let external: TestEnv =
            serde_yaml::from_str("clients: [{name: a, spawn: false}]").unwrap();
        assert!(external.validate().is_err());

        let active: TestEnv =
            serde_yaml::from_str("clients: [{name: a}]\nactive: b").unwrap();
        assert!(active.validate().is_err());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            TestEnv::load(dir.path()),
            Err(Error::FileRead { .. })
        ));
    }
}

//! Per-instance configuration files
//!
//! A spawned service reads its genesis configuration and checkpoint list from
//! its data directory. The genesis copy is derived from a shared base file with
//! delegate owner keys rewritten to the test network's address prefix. The
//! checkpoint file holds a single record far beyond any real block, which turns
//! off the service's built-in checkpoint enforcement.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::common::{Error, Result};

pub const GENESIS_FILE: &str = "genesis.json";
pub const CHECKPOINTS_FILE: &str = "checkpoints.json";

/// Checkpoint record at a block number no test chain will reach
pub const BYPASS_CHECKPOINTS: &str = "[[999999999, \"9999999999999999999999999999999999999999\"]]\n";

/// Rewrite delegate owner prefixes in place
///
/// Owners starting with any of `known_prefixes` get that prefix replaced by
/// `prefix`. Other fields are left untouched.
pub fn rewrite_prefixes(genesis: &mut Value, prefix: &str, known_prefixes: &[String]) -> usize {
    let Some(delegates) = genesis.get_mut("delegates").and_then(Value::as_array_mut) else {
        return 0;
    };

    let mut rewritten = 0;
    for delegate in delegates {
        let Some(Value::String(owner)) = delegate.get_mut("owner") else {
            continue;
        };
        if let Some(known) = known_prefixes.iter().find(|p| owner.starts_with(p.as_str())) {
            *owner = format!("{prefix}{}", &owner[known.len()..]);
            rewritten += 1;
        }
    }
    rewritten
}

/// Write the derived genesis file into `data_dir` and return its path
pub fn write_genesis(
    base: &Path,
    data_dir: &Path,
    prefix: &str,
    known_prefixes: &[String],
) -> Result<PathBuf> {
    let content = std::fs::read_to_string(base).map_err(|e| Error::file_read(base, e))?;
    let mut genesis: Value = serde_json::from_str(&content)?;
    let rewritten = rewrite_prefixes(&mut genesis, prefix, known_prefixes);
    tracing::debug!(base = %base.display(), rewritten, "derived genesis configuration");

    let path = data_dir.join(GENESIS_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&genesis)?)?;
    Ok(path)
}

/// Write the checkpoint bypass file into `data_dir`
pub fn write_checkpoints(data_dir: &Path) -> Result<PathBuf> {
    let path = data_dir.join(CHECKPOINTS_FILE);
    std::fs::write(&path, BYPASS_CHECKPOINTS)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn known() -> Vec<String> {
        vec!["XTS".into(), "DVS".into(), "BTS".into()]
    }

    #[test]
    fn test_owner_prefixes_rewritten() {
        let mut genesis = json!({
            "timestamp": "20140620T144030",
            "delegates": [
                {"name": "init0", "owner": "BTS6abc"},
                {"name": "init1", "owner": "DVS7def"},
                {"name": "init2", "owner": "PTS8ghi"}
            ]
        });
        assert_eq!(rewrite_prefixes(&mut genesis, "XTS", &known()), 2);
        assert_eq!(genesis["delegates"][0]["owner"], "XTS6abc");
        assert_eq!(genesis["delegates"][1]["owner"], "XTS7def");
        assert_eq!(genesis["delegates"][2]["owner"], "PTS8ghi");
        assert_eq!(genesis["timestamp"], "20140620T144030");
    }

    #[test]
    fn test_missing_delegates_is_noop() {
        let mut genesis = json!({"balances": []});
        assert_eq!(rewrite_prefixes(&mut genesis, "XTS", &known()), 0);
    }

    #[test]
    fn test_files_written_into_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.json");
        std::fs::write(
            &base,
            r#"{"delegates": [{"owner": "BTS1"}], "supply": 2000000000.00001}"#,
        )
        .unwrap();

        let data_dir = dir.path().join("alice");
        std::fs::create_dir_all(&data_dir).unwrap();

        let genesis = write_genesis(&base, &data_dir, "XTS", &known()).unwrap();
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&genesis).unwrap()).unwrap();
        assert_eq!(written["delegates"][0]["owner"], "XTS1");
        assert_eq!(written["supply"].to_string(), "2000000000.00001");

        let checkpoints = write_checkpoints(&data_dir).unwrap();
        assert_eq!(
            std::fs::read_to_string(checkpoints).unwrap(),
            BYPASS_CHECKPOINTS
        );
    }
}

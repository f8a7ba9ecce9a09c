//! Configuration and output paths

use std::path::{Path, PathBuf};

/// Name used for the configuration directory
const APP_NAME: &str = "rpctest";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/rpctest/`
/// - macOS: `~/Library/Application Support/rpctest/`
/// - Windows: `%APPDATA%\rpctest\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Output directory of one test: `<out_root>/<test name>`
pub fn test_out_dir(out_root: &Path, test_name: &str) -> PathBuf {
    out_root.join(test_name)
}

/// Pid file of a spawned client, kept next to its data directory
pub fn pid_file(test_dir: &Path, client_name: &str) -> PathBuf {
    test_dir.join(format!("{client_name}.pid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_is_valid() {
        let dir = config_dir();
        assert!(dir.is_some());
    }

    #[test]
    fn test_pid_file_named_after_client() {
        let path = pid_file(Path::new("/tmp/out/transfer"), "alice");
        assert_eq!(path, PathBuf::from("/tmp/out/transfer/alice.pid"));
    }
}

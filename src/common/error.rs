//! Error types for the test harness
//!
//! Fatal errors unwind the whole run. Match failures are not errors: they are
//! recorded on the client's output state and reported once the run completes.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Script Errors ===
    #[error("{}:{line}:{column}: syntax error: {message}", file.display())]
    ScriptSyntax {
        file: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{}:{line}:{column}: unknown directive '{directive}'", file.display())]
    UnknownDirective {
        file: PathBuf,
        line: usize,
        column: usize,
        directive: String,
    },

    #[error("{}:{line}:{column}: undefined variable '${name}'", file.display())]
    UnknownVariable {
        file: PathBuf,
        name: String,
        line: usize,
        column: usize,
    },

    #[error("No client registered under the name '{0}'")]
    UnknownClient(String),

    #[error("No active client. Select one with '>>> !client NAME' first")]
    NoActiveClient,

    #[error("Expression error: {0}")]
    Expression(String),

    // === RPC Errors ===
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("RPC response id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: u64, got: String },

    #[error("line {line}: command '{command}' failed: {source}")]
    Command {
        command: String,
        line: usize,
        #[source]
        source: Box<Error>,
    },

    // === Process Errors ===
    #[error("Failed to start service process: {0}")]
    ProcessStart(String),

    #[error("Process '{0}' already started. Call stop() before starting it again")]
    AlreadyStarted(String),

    #[error("Service did not answer RPC within {0} seconds")]
    ReadyTimeout(u64),

    #[error("Every port in [{min}, {max}) is in use")]
    PortsExhausted { min: u16, max: u16 },

    #[error("Operation cancelled")]
    Cancelled,

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a syntax error at a script location
    pub fn syntax(file: impl Into<PathBuf>, line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::ScriptSyntax {
            file: file.into(),
            line,
            column,
            message: message.into(),
        }
    }

    /// Wrap an RPC failure with the command that triggered it
    pub fn command(command: &str, line: usize, source: Error) -> Self {
        Self::Command {
            command: command.to_string(),
            line,
            source: Box::new(source),
        }
    }

    /// Create a file read error
    pub fn file_read(path: &std::path::Path, error: impl std::fmt::Display) -> Self {
        Self::FileRead {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Whether this error (or the error it wraps) came from run cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Command { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Transport(format!("request timed out: {e}"))
        } else if e.is_connect() {
            Error::Transport(format!("connection failed: {e}"))
        } else {
            Error::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_reports_location() {
        let e = Error::syntax("tests/a.btstest", 3, 7, "bad token");
        assert_eq!(e.to_string(), "tests/a.btstest:3:7: syntax error: bad token");
    }

    #[test]
    fn test_command_wraps_cancellation() {
        let e = Error::command("get_info", 4, Error::Cancelled);
        assert!(e.is_cancelled());
        assert!(e.to_string().contains("get_info"));
        assert!(!Error::NoActiveClient.is_cancelled());
    }
}

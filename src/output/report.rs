//! Failure report
//!
//! Mismatches are collected while a run proceeds and rendered once at the end
//! as a diff of expected against actual fragments.

use std::fmt::Write as _;
use std::path::PathBuf;

use similar::TextDiff;

/// One failed expectation, with enough context to find it in the script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFailure {
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
    /// Client whose output was being checked
    pub client: String,
    /// Command that produced the output, if any was run yet
    pub command: Option<String>,
    pub expected: String,
    pub actual: String,
}

impl MatchFailure {
    /// `file:line:col` of the expectation
    pub fn location(&self) -> String {
        format!("{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// Render every failure as a unified diff hunk
pub fn render(failures: &[MatchFailure]) -> String {
    let mut out = String::new();
    for failure in failures {
        let expected = with_newline(&failure.expected);
        let actual = with_newline(&failure.actual);
        let diff = TextDiff::from_lines(&expected, &actual);

        let command = failure
            .command
            .as_deref()
            .map(|c| format!(" >>> {c}"))
            .unwrap_or_default();
        let _ = writeln!(out, "{} [{}]{}", failure.location(), failure.client, command);
        let _ = write!(
            out,
            "{}",
            diff.unified_diff().header("expected", "actual")
        );
    }
    out
}

/// One-line summary: `3 mismatches in 2 commands`
pub fn summary(failures: &[MatchFailure]) -> String {
    let mut commands: Vec<(&str, Option<&str>)> = failures
        .iter()
        .map(|f| (f.client.as_str(), f.command.as_deref()))
        .collect();
    commands.dedup();
    format!(
        "{} mismatch{} in {} command{}",
        failures.len(),
        if failures.len() == 1 { "" } else { "es" },
        commands.len(),
        if commands.len() == 1 { "" } else { "s" },
    )
}

fn with_newline(s: &str) -> String {
    if s.ends_with('\n') {
        s.to_string()
    } else {
        format!("{s}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(expected: &str, actual: &str) -> MatchFailure {
        MatchFailure {
            file: PathBuf::from("transfer/01_balance.btstest"),
            line: 4,
            column: 9,
            client: "alice".to_string(),
            command: Some("wallet_account_balance".to_string()),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    #[test]
    fn test_render_shows_both_fragments() {
        let report = render(&[failure("1000", "999")]);
        assert!(report.starts_with(
            "transfer/01_balance.btstest:4:9 [alice] >>> wallet_account_balance\n"
        ));
        assert!(report.contains("--- expected"));
        assert!(report.contains("+++ actual"));
        assert!(report.contains("-1000\n"));
        assert!(report.contains("+999\n"));
    }

    #[test]
    fn test_summary_counts_commands() {
        let mut other = failure("a", "b");
        other.command = Some("get_info".to_string());
        assert_eq!(
            summary(&[failure("1", "2"), failure("3", "4"), other]),
            "3 mismatches in 2 commands"
        );
        assert_eq!(summary(&[failure("1", "2")]), "1 mismatch in 1 command");
    }
}

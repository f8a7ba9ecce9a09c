//! Script interpreter
//!
//! Walks the token stream of a script, sending `>>>` commands to the active
//! client and checking everything else against that client's latest output.
//! Mismatches are recorded and execution continues; only syntax, directive,
//! lookup and RPC errors stop the run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};
use crate::output::{MatchFailure, MatchOutcome};

use super::context::ExecutionContext;
use super::expr::{self, ExpectHost, Expectation, Value};
use super::lexer::{tokenize, Token, TokenKind, COMMAND_MARKER};

/// How the result of an expectation shows up in the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Echo {
    /// Literal script text: echo the match, or the expected/actual pair
    Literal,
    /// Raised from an expression: collect the match for `~{...}~`
    Capture,
    /// Variable reference: the value itself was already collected
    Silent,
}

/// Executes scripts against an [`ExecutionContext`]
pub struct Interpreter<'a> {
    ctx: &'a mut ExecutionContext,
    file: PathBuf,
    /// Position of the token being executed
    line: usize,
    column: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(ctx: &'a mut ExecutionContext) -> Self {
        Self {
            ctx,
            file: PathBuf::from("<script>"),
            line: 0,
            column: 0,
        }
    }

    /// Run every script with `extension` in `dir`, in filename order
    ///
    /// Returns the number of scripts run.
    pub async fn run_dir(&mut self, dir: &Path, extension: &str) -> Result<usize> {
        let scripts = script_files(dir, extension)?;
        for path in &scripts {
            self.run_file(path).await?;
        }
        Ok(scripts.len())
    }

    pub async fn run_file(&mut self, path: &Path) -> Result<()> {
        let src = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        tracing::info!(script = %path.display(), "running script");
        self.file = path.to_path_buf();
        self.run_script(&src).await
    }

    /// Run one script's text
    pub async fn run_script(&mut self, src: &str) -> Result<()> {
        let mut in_command = false;
        let mut command = String::new();
        let mut command_at = (0, 0);

        for token in tokenize(src) {
            self.line = token.line;
            self.column = token.column;
            tracing::trace!(line = token.line, column = token.column, text = ?token.text, "token");

            match token.kind() {
                TokenKind::CommandMarker if !in_command => {
                    self.flush_residual();
                    in_command = true;
                    command.clear();
                    command_at = (token.line, token.column);
                    if self.ctx.show_line_numbers {
                        self.ctx.transcript.write(&format!("L{}: ", token.line));
                    }
                    self.ctx.transcript.write(COMMAND_MARKER);
                }
                TokenKind::Newline | TokenKind::Whitespace if token.ends_line() => {
                    if in_command {
                        in_command = false;
                        let (line, column) = command_at;
                        self.execute_command(command.trim(), line, column).await?;
                        command.clear();
                    }
                    self.ctx.transcript.write(token.text);
                }
                TokenKind::Whitespace => {
                    if in_command {
                        command.push_str(token.text);
                    }
                    self.ctx.transcript.write(token.text);
                }
                TokenKind::Expression => self.expression(&token)?,
                TokenKind::Variable => {
                    let value = self.variable(&token)?;
                    self.ctx.matchbuf.push(value.clone());
                    if in_command {
                        command.push_str(&value);
                    } else {
                        self.check(Expectation::Literal(value), Echo::Silent)?;
                    }
                    self.ctx.transcript.write(token.text);
                    self.dump_matchbuf(self.ctx.show_match);
                }
                TokenKind::Comment => self.ctx.transcript.write(token.text),
                // Also a stray `>>>` inside a command line
                TokenKind::CommandMarker | TokenKind::Literal | TokenKind::Newline => {
                    if token.text.contains("${") {
                        return Err(Error::syntax(
                            &self.file,
                            token.line,
                            token.column,
                            "unterminated expression block, expected '}$'",
                        ));
                    }
                    if in_command {
                        command.push_str(token.text);
                        self.ctx.transcript.write(token.text);
                    } else {
                        self.check(Expectation::Literal(token.text.to_string()), Echo::Literal)?;
                    }
                    self.dump_matchbuf(false);
                }
            }
        }

        if in_command {
            let (line, column) = command_at;
            self.execute_command(command.trim(), line, column).await?;
        }
        self.flush_residual();
        Ok(())
    }

    fn variable(&self, token: &Token<'_>) -> Result<String> {
        let name = &token.text[1..];
        self.ctx
            .vars
            .get(name)
            .map(Value::to_string)
            .ok_or_else(|| Error::UnknownVariable {
                file: self.file.clone(),
                name: name.to_string(),
                line: token.line,
                column: token.column,
            })
    }

    fn expression(&mut self, token: &Token<'_>) -> Result<()> {
        let (source, _recorded) = token.expression_parts().ok_or_else(|| {
            Error::syntax(&self.file, token.line, token.column, "malformed expression block")
        })?;

        // The environment is lent to the evaluator while `self` serves expectations
        let mut vars = std::mem::take(&mut self.ctx.vars);
        let result = expr::eval(source, &mut vars, self);
        self.ctx.vars = vars;

        let value = result.map_err(|e| match e {
            Error::Expression(message) => {
                Error::syntax(&self.file, token.line, token.column, message)
            }
            other => other,
        })?;
        if let Value::Str(s) = value {
            self.check(Expectation::Literal(s), Echo::Capture)?;
        }

        self.ctx.transcript.write(&format!("${{{source}}}$"));
        self.dump_matchbuf(self.ctx.show_match);
        Ok(())
    }

    async fn execute_command(&mut self, command: &str, line: usize, column: usize) -> Result<()> {
        if command.starts_with('!') {
            return self.directive(command, line, column);
        }

        let client = self.ctx.active_client_mut()?;
        tracing::debug!(client = %client.name, command, line, "executing command");
        let output = client
            .channel
            .execute_command_line(command)
            .await
            .map_err(|e| Error::command(command, line, e))?;
        client.output.reset(output);
        client.last_command = Some(command.to_string());

        let name = client.name.clone();
        self.ctx.pending_client = Some(name);
        Ok(())
    }

    fn directive(&mut self, command: &str, line: usize, column: usize) -> Result<()> {
        let file = self.file.clone();
        let unknown = || Error::UnknownDirective {
            file: file.clone(),
            line,
            column,
            directive: command.to_string(),
        };
        let switch = |arg: Option<&str>| match arg {
            Some("enable") => Ok(true),
            Some("disable") => Ok(false),
            _ => Err(unknown()),
        };

        let mut words = command.split_whitespace();
        let name = words.next().unwrap_or_default();
        let arg = words.next();
        if words.next().is_some() {
            return Err(unknown());
        }

        match name {
            "!client" => {
                let client = arg.ok_or_else(unknown)?;
                tracing::debug!(client, "switching active client");
                self.ctx.active_client = Some(client.to_string());
            }
            "!expect" => self.ctx.expect_enabled = switch(arg)?,
            "!showmatch" => self.ctx.show_match = switch(arg)?,
            "!showlinenumber" | "!showlineno" => self.ctx.show_line_numbers = switch(arg)?,
            _ => return Err(unknown()),
        }
        Ok(())
    }

    /// Check one expectation against the active client's output
    fn check(&mut self, expectation: Expectation, echo: Echo) -> Result<HashMap<String, String>> {
        if !self.ctx.expect_enabled {
            if let (Echo::Literal, Expectation::Literal(s)) = (echo, &expectation) {
                self.ctx.transcript.write(s);
            }
            return Ok(HashMap::new());
        }
        if matches!(&expectation, Expectation::Literal(s) if s.is_empty()) {
            return Ok(HashMap::new());
        }

        let client = self.ctx.active_client_mut()?;
        let outcome = match &expectation {
            Expectation::Literal(s) => client.output.match_literal(s),
            Expectation::Regex(pattern) => client.output.match_regex(pattern)?,
            Expectation::Json => client.output.match_json(),
            Expectation::RelativeTime => client.output.match_relative_time(),
            Expectation::IsoTime => client.output.match_isotime(),
        };
        let client_name = client.name.clone();
        let command = client.last_command.clone();

        match outcome {
            MatchOutcome::Matched { text, groups } => {
                match echo {
                    Echo::Literal => self.ctx.transcript.write(&text),
                    Echo::Capture => self.ctx.matchbuf.push(text),
                    Echo::Silent => {}
                }
                Ok(groups)
            }
            MatchOutcome::Mismatch { expected, actual } => {
                if echo == Echo::Literal {
                    self.ctx
                        .transcript
                        .write(&format!("!{{ {expected} }}!~{{ {actual} }}~"));
                }
                self.ctx.failures.push(MatchFailure {
                    file: self.file.clone(),
                    line: self.line,
                    column: self.column,
                    client: client_name,
                    command,
                    expected,
                    actual,
                });
                Ok(HashMap::new())
            }
        }
    }

    fn dump_matchbuf(&mut self, show: bool) {
        if show {
            let matched = self.ctx.matchbuf.concat();
            self.ctx.transcript.write(&format!("~{{{matched}}}~"));
        }
        self.ctx.matchbuf.clear();
    }

    /// Echo output the previous command produced but no expectation consumed
    fn flush_residual(&mut self) {
        let Some(name) = self.ctx.pending_client.take() else {
            return;
        };
        let Ok(client) = self.ctx.client(&name) else {
            return;
        };
        let residual = client.output.residual().to_string();
        if residual.trim().is_empty() {
            return;
        }
        if self.ctx.expect_enabled && self.ctx.show_match {
            self.ctx
                .transcript
                .write(&format!("!{{ }}!~{{ {} }}~\n", residual.trim()));
        } else {
            self.ctx.transcript.write(&residual);
        }
    }
}

impl ExpectHost for Interpreter<'_> {
    fn expect(&mut self, expectation: Expectation) -> Result<HashMap<String, String>> {
        self.check(expectation, Echo::Capture)
    }
}

/// Script files in `dir` with the given extension, sorted by name
pub fn script_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::file_read(dir, e))?;
    let mut scripts = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::context::tests::ScriptedChannel;
    use crate::script::context::Client;

    const INFO: &str = "blockchain_head_block_num 12\nwallet_open true\n";

    fn context(replies: &[(&str, &str)]) -> ExecutionContext {
        let mut ctx = ExecutionContext::default();
        ctx.register_client(Client::new("alice", Box::new(ScriptedChannel::new(replies))));
        ctx
    }

    async fn run(ctx: &mut ExecutionContext, script: &str) -> Result<()> {
        Interpreter::new(ctx).run_script(script).await
    }

    #[tokio::test]
    async fn test_matching_script_has_no_failures() {
        let mut ctx = context(&[("get_info", INFO)]);
        run(&mut ctx, ">>> get_info\nblockchain_head_block_num 12\n")
            .await
            .unwrap();
        assert!(ctx.failures.is_empty());
        assert_eq!(ctx.failure_count(), 0);
        assert_eq!(
            ctx.transcript.as_str(),
            ">>> get_info\nblockchain_head_block_num 12\n\nwallet_open true\n"
        );
    }

    #[tokio::test]
    async fn test_wrong_literal_fails_once_and_continues() {
        let mut ctx = context(&[("get_info", INFO)]);
        run(
            &mut ctx,
            ">>> get_info\nblockchain_head_block_num 13\nwallet_open true\n",
        )
        .await
        .unwrap();

        assert_eq!(ctx.failure_count(), 1);
        assert_eq!(ctx.failures.len(), 1);
        let failure = &ctx.failures[0];
        assert_eq!((failure.expected.as_str(), failure.actual.as_str()), ("13", "12"));
        assert_eq!((failure.line, failure.column), (2, 27));
        assert_eq!(failure.command.as_deref(), Some("get_info"));
        assert!(ctx.transcript.as_str().contains("!{ 13 }!~{ 12 }~"));
        assert!(ctx.transcript.as_str().contains("wallet_open true"));
    }

    #[tokio::test]
    async fn test_variables_interpolate_into_commands_and_expectations() {
        let mut ctx = context(&[("echo 42", "42\n")]);
        ctx.vars.set("answer", 42i64);
        run(&mut ctx, ">>> echo $answer\n$answer\n").await.unwrap();
        assert!(ctx.failures.is_empty());
        assert_eq!(ctx.transcript.as_str(), ">>> echo $answer\n$answer\n");
    }

    #[tokio::test]
    async fn test_unknown_variable_is_fatal() {
        let mut ctx = context(&[]);
        let err = run(&mut ctx, ">>> echo $missing\n").await.unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownVariable { ref name, line: 1, column: 10, .. } if name == "missing"
        ));
    }

    #[tokio::test]
    async fn test_expressions_share_environment_and_expect() {
        let mut ctx = context(&[("about", "version 0.4.2 built 2014-07-01T10:00:00\n")]);
        let script = "\
${ v = \"0.4\" }$
>>> about
version ${ v + \".2\" }$ built ${ expect_isotime() }$
";
        run(&mut ctx, script).await.unwrap();
        assert!(ctx.failures.is_empty(), "{:?}", ctx.failures);
        assert_eq!(ctx.vars.get("v"), Some(&Value::from("0.4")));
    }

    #[tokio::test]
    async fn test_show_match_echoes_captured_text() {
        let mut ctx = context(&[("help", "{\"commands\": 3}\n")]);
        run(
            &mut ctx,
            ">>> !showmatch enable\n>>> help\n${ expect_json() }$\n",
        )
        .await
        .unwrap();
        assert!(ctx
            .transcript
            .as_str()
            .ends_with("${ expect_json() }$~{{\"commands\": 3}}~\n"));
    }

    #[tokio::test]
    async fn test_regex_groups_bind_to_variables() {
        let mut ctx = context(&[("wallet_create_account bob", "XTS7xkz9 created\n")]);
        let script = ">>> wallet_create_account bob\n${ m = expect_regex(\"(?P<key>XTS[0-9a-z]+)\") }$ created\n${ key = m[\"key\"] }$";
        run(&mut ctx, script).await.unwrap();
        assert!(ctx.failures.is_empty());
        assert_eq!(ctx.vars.get("key"), Some(&Value::from("XTS7xkz9")));
    }

    #[tokio::test]
    async fn test_directives_toggle_flags() {
        let mut ctx = context(&[("get_info", INFO)]);
        let script = ">>> !expect disable\n>>> get_info\nnothing like the output\n>>> !showlineno enable\n>>> !expect enable\n";
        run(&mut ctx, script).await.unwrap();
        assert!(ctx.failures.is_empty());
        assert!(ctx.expect_enabled);
        assert!(ctx.show_line_numbers);
        assert!(ctx.transcript.as_str().contains("nothing like the output"));
        assert!(ctx.transcript.as_str().contains("L5: >>>"));
    }

    #[tokio::test]
    async fn test_unknown_directive_is_fatal() {
        let mut ctx = context(&[]);
        let err = run(&mut ctx, "\n>>> !frobnicate on\n").await.unwrap_err();
        assert!(matches!(err, Error::UnknownDirective { line: 2, column: 1, .. }));

        let err = run(&mut ctx, ">>> !expect maybe\n").await.unwrap_err();
        assert!(matches!(err, Error::UnknownDirective { .. }));
    }

    #[tokio::test]
    async fn test_client_switch_keeps_outputs_apart() {
        let mut ctx = context(&[("get_info", INFO)]);
        ctx.register_client(Client::new(
            "bob",
            Box::new(ScriptedChannel::new(&[("get_info", "bob_info\n")])),
        ));

        let script = ">>> get_info\nblockchain_head_block_num\n>>> !client bob\n>>> get_info\nbob_info\n";
        run(&mut ctx, script).await.unwrap();
        assert!(ctx.failures.is_empty());

        let alice = ctx.client("alice").unwrap();
        assert_eq!(alice.output.buffer(), INFO);
        assert_eq!(alice.output.cursor(), "blockchain_head_block_num".len());
        assert_eq!(ctx.client("bob").unwrap().output.buffer(), "bob_info\n");
    }

    #[tokio::test]
    async fn test_residual_output_is_echoed_not_failed() {
        let mut ctx = context(&[("get_info", INFO), ("help", "usage\n")]);
        ctx.show_match = true;
        run(&mut ctx, ">>> get_info\nblockchain_head_block_num\n>>> help\nusage\n")
            .await
            .unwrap();
        assert!(ctx.failures.is_empty());
        assert!(ctx
            .transcript
            .as_str()
            .contains("!{ }!~{ 12\nwallet_open true }~\n>>>"));
    }

    #[tokio::test]
    async fn test_rpc_error_names_command() {
        let mut ctx = context(&[]);
        let err = run(&mut ctx, "#{ setup }#\n>>> bogus_command 1\n").await.unwrap_err();
        match err {
            Error::Command { command, line, source } => {
                assert_eq!(command, "bogus_command 1");
                assert_eq!(line, 2);
                assert!(matches!(*source, Error::Protocol { .. }));
            }
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expression_errors_carry_location() {
        let mut ctx = context(&[]);
        let err = run(&mut ctx, "\n  ${ 1 / 0 }$\n").await.unwrap_err();
        assert!(matches!(err, Error::ScriptSyntax { line: 2, column: 3, .. }));

        let err = run(&mut ctx, "${ never closed\n").await.unwrap_err();
        assert!(matches!(err, Error::ScriptSyntax { line: 1, column: 1, .. }));
    }

    #[tokio::test]
    async fn test_run_dir_uses_filename_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("02_check.btstest"), "$step\n").unwrap();
        std::fs::write(dir.path().join("01_setup.btstest"), "${ step = \"one\" }$\n>>> echo one\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), ">>> never_sent\n").unwrap();

        let mut ctx = context(&[("echo one", "one\n")]);
        let count = Interpreter::new(&mut ctx)
            .run_dir(dir.path(), "btstest")
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(ctx.failures.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_names_report_script_path() {
        let dir = tempfile::tempdir().unwrap();
        let directive = dir.path().join("01_directive.btstest");
        let variable = dir.path().join("02_variable.btstest");
        std::fs::write(&directive, ">>> get_info\n>>> !frobnicate on\n").unwrap();
        std::fs::write(&variable, "\n>>> echo $nowhere\n").unwrap();

        let mut ctx = context(&[("get_info", INFO)]);
        let err = Interpreter::new(&mut ctx).run_file(&directive).await.unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownDirective { ref file, line: 2, .. } if file == &directive
        ));
        assert!(err.to_string().starts_with(&format!("{}:2:1:", directive.display())));

        let err = Interpreter::new(&mut ctx).run_file(&variable).await.unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownVariable { ref file, line: 2, .. } if file == &variable
        ));
    }
}

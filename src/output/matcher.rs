//! Output matching against a command's captured text
//!
//! Every primitive first skips whitespace, then tries to consume a prefix of
//! the remaining output. A mismatch never aborts: the cursor is moved past the
//! next run of non-whitespace so later expectations can still line up, and the
//! failure is counted.

use std::collections::HashMap;

use regex::Regex;
use serde::de::IgnoredAny;

use crate::common::{Error, Result};

/// Human-readable durations such as `5 minutes ago` or `2 days in the future`
pub const RELATIVE_TIME_PATTERN: &str =
    r"[0-9]+\s+(?:second|minute|hour|day|week|month|year)[s]?\s+(?:ago|old|remaining|in\s+the\s+future)";

/// ISO-8601 timestamps as printed by the service, e.g. `2014-06-20T14:13:00`
pub const ISO_TIME_PATTERN: &str =
    r"[0-9]+[-][0-9]{2}[-][0-9]{2}[T][0-9]{2}[:][0-9]{2}[:][0-9]{2}";

/// Placeholder shown as the expected value of a failed JSON match
pub const JSON_PLACEHOLDER: &str = "<json>";

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\x0c' | '\x0b' | '\r' | '\n')
}

/// Result of one match primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The expectation consumed `text`; regex matches also report named groups
    Matched {
        text: String,
        groups: HashMap<String, String>,
    },
    /// The expectation did not match; `actual` is the text skipped to resync
    Mismatch { expected: String, actual: String },
}

impl MatchOutcome {
    fn matched(text: &str) -> Self {
        Self::Matched {
            text: text.to_string(),
            groups: HashMap::new(),
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

/// The latest command output of one client and how far it has been checked
#[derive(Debug, Default)]
pub struct OutputState {
    buffer: String,
    cursor: usize,
    has_failed: bool,
    failure_count: usize,
    regex_cache: HashMap<String, Regex>,
}

impl OutputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the buffer with a new command's output
    ///
    /// The failure count survives; it covers the whole run.
    pub fn reset(&mut self, output: impl Into<String>) {
        self.buffer = output.into();
        self.cursor = 0;
        self.has_failed = false;
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether any expectation failed against the current buffer
    pub fn has_failed(&self) -> bool {
        self.has_failed
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    /// Output not yet consumed by any expectation
    pub fn residual(&self) -> &str {
        &self.buffer[self.cursor..]
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.buffer[self.cursor..];
        let skipped = rest.len() - rest.trim_start_matches(is_space).len();
        self.cursor += skipped;
    }

    fn fail(&mut self, expected: &str) -> MatchOutcome {
        let rest = &self.buffer[self.cursor..];
        let token_len = rest.find(is_space).unwrap_or(rest.len());
        let actual = rest[..token_len].to_string();
        self.cursor += token_len;
        self.has_failed = true;
        self.failure_count += 1;
        tracing::debug!(expected, actual = %actual, cursor = self.cursor, "expectation failed");
        MatchOutcome::Mismatch {
            expected: expected.to_string(),
            actual,
        }
    }

    /// Expect `s` verbatim at the cursor
    pub fn match_literal(&mut self, s: &str) -> MatchOutcome {
        self.skip_whitespace();
        if self.buffer[self.cursor..].starts_with(s) {
            let start = self.cursor;
            self.cursor += s.len();
            MatchOutcome::matched(&self.buffer[start..self.cursor])
        } else {
            self.fail(s)
        }
    }

    /// Expect `pattern` to match at the cursor
    ///
    /// An invalid pattern is a script error, not a mismatch.
    pub fn match_regex(&mut self, pattern: &str) -> Result<MatchOutcome> {
        self.skip_whitespace();

        if !self.regex_cache.contains_key(pattern) {
            let anchored = Regex::new(&format!(r"\A(?:{pattern})"))
                .map_err(|e| Error::Expression(format!("invalid regex '{pattern}': {e}")))?;
            self.regex_cache.insert(pattern.to_string(), anchored);
        }
        let re = &self.regex_cache[pattern];

        let rest = &self.buffer[self.cursor..];
        let Some(caps) = re.captures(rest) else {
            return Ok(self.fail(pattern));
        };

        let whole = caps.get(0).map_or("", |m| m.as_str()).to_string();
        let groups = re
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();

        self.cursor += whole.len();
        Ok(MatchOutcome::Matched {
            text: whole,
            groups,
        })
    }

    /// Expect one complete JSON value at the cursor
    ///
    /// Decode failures consume the whole remainder as a single failure.
    pub fn match_json(&mut self) -> MatchOutcome {
        self.skip_whitespace();
        let rest = &self.buffer[self.cursor..];

        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<IgnoredAny>();
        match stream.next() {
            Some(Ok(_)) => {
                let consumed = stream.byte_offset();
                let start = self.cursor;
                self.cursor += consumed;
                MatchOutcome::matched(&self.buffer[start..self.cursor])
            }
            _ => {
                let actual = rest.to_string();
                self.cursor = self.buffer.len();
                self.has_failed = true;
                self.failure_count += 1;
                MatchOutcome::Mismatch {
                    expected: JSON_PLACEHOLDER.to_string(),
                    actual,
                }
            }
        }
    }

    /// Expect a relative duration such as `3 hours ago`
    pub fn match_relative_time(&mut self) -> MatchOutcome {
        self.match_builtin(RELATIVE_TIME_PATTERN)
    }

    /// Expect an ISO-8601 timestamp
    pub fn match_isotime(&mut self) -> MatchOutcome {
        self.match_builtin(ISO_TIME_PATTERN)
    }

    fn match_builtin(&mut self, pattern: &str) -> MatchOutcome {
        match self.match_regex(pattern) {
            Ok(outcome) => outcome,
            // Built-in patterns are constants that always compile
            Err(_) => self.fail(pattern),
        }
    }
}

//! Per-run execution state
//!
//! One [`ExecutionContext`] lives for a whole test run. It owns the variable
//! environment, the registered clients with their output buffers, the mode
//! flags toggled by `!` directives, and the failures recorded so far.

use std::collections::BTreeMap;
use std::io::Write;

use crate::common::{Error, Result};
use crate::output::{MatchFailure, OutputState};
use crate::process::ProcessHandle;
use crate::rpc::CommandChannel;

use super::expr::Env;

/// A named connection to one service instance
pub struct Client {
    pub name: String,
    /// Present when the harness spawned the instance itself
    pub process: Option<ProcessHandle>,
    pub channel: Box<dyn CommandChannel>,
    pub output: OutputState,
    /// Text of the last command sent, for failure reports
    pub last_command: Option<String>,
}

impl Client {
    pub fn new(name: impl Into<String>, channel: Box<dyn CommandChannel>) -> Self {
        Self {
            name: name.into(),
            process: None,
            channel,
            output: OutputState::new(),
            last_command: None,
        }
    }

    pub fn with_process(mut self, process: ProcessHandle) -> Self {
        self.process = Some(process);
        self
    }
}

/// Echo of the script as it runs, with matched output substituted in
#[derive(Debug, Default)]
pub struct Transcript {
    text: String,
    /// Also print to stdout as text arrives
    pub echo: bool,
}

impl Transcript {
    pub fn write(&mut self, s: &str) {
        if self.echo {
            self.write_to(s, &mut std::io::stdout().lock());
        } else {
            self.write_to(s, &mut std::io::sink());
        }
    }

    /// Record `s` and echo it to `out`; a failed echo never loses text
    fn write_to(&mut self, s: &str, out: &mut impl Write) {
        if s.is_empty() {
            return;
        }
        self.text.push_str(s);
        if let Err(e) = out.write_all(s.as_bytes()).and_then(|()| out.flush()) {
            tracing::debug!(error = %e, "transcript echo failed");
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Mutable state shared by every script of one run
pub struct ExecutionContext {
    pub vars: Env,
    /// Client receiving commands and expectations
    pub active_client: Option<String>,
    pub expect_enabled: bool,
    pub show_match: bool,
    pub show_line_numbers: bool,
    /// Text matched since the last dump
    pub matchbuf: Vec<String>,
    pub failures: Vec<MatchFailure>,
    pub transcript: Transcript,
    /// Client whose last output may still hold unconsumed text
    pub(crate) pending_client: Option<String>,
    clients: BTreeMap<String, Client>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            vars: Env::new(),
            active_client: None,
            expect_enabled: true,
            show_match: false,
            show_line_numbers: false,
            matchbuf: Vec::new(),
            failures: Vec::new(),
            transcript: Transcript::default(),
            pending_client: None,
            clients: BTreeMap::new(),
        }
    }
}

impl ExecutionContext {
    pub fn new(vars: Env) -> Self {
        Self {
            vars,
            ..Self::default()
        }
    }

    /// Add a client; the first one registered becomes active
    pub fn register_client(&mut self, client: Client) {
        tracing::debug!(name = %client.name, spawned = client.process.is_some(), "registered client");
        if self.active_client.is_none() {
            self.active_client = Some(client.name.clone());
        }
        self.clients.insert(client.name.clone(), client);
    }

    pub fn client(&self, name: &str) -> Result<&Client> {
        self.clients
            .get(name)
            .ok_or_else(|| Error::UnknownClient(name.to_string()))
    }

    pub fn client_mut(&mut self, name: &str) -> Result<&mut Client> {
        self.clients
            .get_mut(name)
            .ok_or_else(|| Error::UnknownClient(name.to_string()))
    }

    pub fn active_client_mut(&mut self) -> Result<&mut Client> {
        let name = self.active_client.clone().ok_or(Error::NoActiveClient)?;
        self.client_mut(&name)
    }

    pub fn client_names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    /// Mismatches across every client
    pub fn failure_count(&self) -> usize {
        self.clients.values().map(|c| c.output.failure_count()).sum()
    }

    /// Stop every spawned process, returning the first error after trying all
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut first_error = None;
        for client in self.clients.values_mut() {
            if let Some(process) = client.process.as_mut() {
                if let Err(e) = process.stop().await {
                    tracing::warn!(client = %client.name, error = %e, "failed to stop service");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

//! TCP port allocation for spawned instances
//!
//! Ports come from a half-open range `[min, max)` in round-robin order. The
//! probing variant also skips ports the kernel reports as listening; where
//! `/proc/net/tcp` is unavailable it quietly behaves like the plain one.
//! Neither protects against other processes grabbing a port between
//! allocation and bind.

use std::collections::HashSet;

use crate::common::config::PortsConfig;
use crate::common::{Error, Result};

const PROC_NET_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];

/// Round-robin allocator over `[min, max)`
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    next: u16,
    probe_os: bool,
}

impl PortAllocator {
    /// Allocator that trusts the range blindly
    pub fn new(min: u16, max: u16) -> Self {
        let max = max.max(min.saturating_add(1));
        Self {
            min,
            max,
            next: min,
            probe_os: false,
        }
    }

    /// Allocator that skips ports already bound on this host
    pub fn probing(min: u16, max: u16) -> Self {
        Self {
            probe_os: true,
            ..Self::new(min, max)
        }
    }

    pub fn from_config(config: &PortsConfig) -> Self {
        if config.probe_os {
            Self::probing(config.min, config.max)
        } else {
            Self::new(config.min, config.max)
        }
    }

    /// Split `[min, max)` into `count` disjoint allocators, returning the `index`th
    ///
    /// Used to give concurrent runs non-overlapping ranges. Fails when the
    /// range is empty or too narrow to give every slice at least one port.
    pub fn slice(config: &PortsConfig, index: usize, count: usize) -> Result<Self> {
        if config.max <= config.min {
            return Err(Error::Config(format!(
                "port range [{}, {}) is empty",
                config.min, config.max
            )));
        }
        let count = count.max(1);
        let span = usize::from(config.max - config.min);
        if count > span {
            return Err(Error::Config(format!(
                "port range [{}, {}) holds {span} ports, too few for {count} concurrent jobs",
                config.min, config.max
            )));
        }

        let width = span / count;
        let start = usize::from(config.min) + (index % count) * width;
        let end = start + width;
        let (Ok(start), Ok(end)) = (u16::try_from(start), u16::try_from(end)) else {
            return Err(Error::Internal(format!("port slice {start}..{end} out of range")));
        };

        let slice = PortsConfig {
            min: start,
            max: end,
            probe_os: config.probe_os,
        };
        Ok(Self::from_config(&slice))
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    fn advance(&mut self) -> u16 {
        let port = self.next;
        self.next = port
            .checked_add(1)
            .filter(|p| *p < self.max)
            .unwrap_or(self.min);
        port
    }

    /// Hand out the next port
    pub fn next_port(&mut self) -> Result<u16> {
        if !self.probe_os {
            return Ok(self.advance());
        }

        let Some(busy) = listening_ports() else {
            return Ok(self.advance());
        };

        for _ in self.min..self.max {
            let port = self.advance();
            if !busy.contains(&port) {
                return Ok(port);
            }
            tracing::debug!(port, "skipping port already in use");
        }
        Err(Error::PortsExhausted {
            min: self.min,
            max: self.max,
        })
    }
}

/// Ports with a listening socket, or `None` if no table could be read
fn listening_ports() -> Option<HashSet<u16>> {
    let mut found = None;
    for table in PROC_NET_TABLES {
        match std::fs::read_to_string(table) {
            Ok(content) => found
                .get_or_insert_with(HashSet::new)
                .extend(parse_listening(&content)),
            Err(e) => tracing::debug!(table, error = %e, "TCP table unavailable"),
        }
    }
    found
}

/// Extract listening local ports from a `/proc/net/tcp` style table
///
/// A socket is listening when its remote address is unset (`...:0000`).
pub fn parse_listening(table: &str) -> impl Iterator<Item = u16> + '_ {
    table.lines().skip(1).filter_map(|row| {
        let mut fields = row.split_whitespace();
        let local = fields.nth(1)?;
        let remote = fields.next()?;
        if !remote.ends_with(":0000") {
            return None;
        }
        let (_, port) = local.rsplit_once(':')?;
        u16::from_str_radix(port, 16).ok()
    })
}

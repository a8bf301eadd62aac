use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use std::collections::HashMap;

/// Key/value credentials loaded once at startup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialSet {
    entries: HashMap<String, String>,
}

impl CredentialSet {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<HashMap<String, String>> for CredentialSet {
    fn from(entries: HashMap<String, String>) -> Self {
        Self::new(entries)
    }
}

/// Environment assignments derived from a credential set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentBlock {
    vars: Vec<(String, String)>,
}

impl EnvironmentBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: String, value: String) {
        self.vars.push((name, value));
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// `NAME=value` strings in block order
    pub fn entries(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// How the environment block is applied to the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvMode {
    /// A non-empty block becomes the child's whole environment
    #[default]
    Replace,
    /// The block is layered over the inherited environment
    Merge,
}

impl std::str::FromStr for EnvMode {
    type Err = crate::PidoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(EnvMode::Replace),
            "merge" => Ok(EnvMode::Merge),
            other => Err(crate::PidoneError::InvalidConfiguration(format!(
                "unknown env mode '{}', expected 'replace' or 'merge'",
                other
            ))),
        }
    }
}

/// How the child's standard streams are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// Child runs on a pseudo-terminal, supervisor stdin is raw
    Interactive,
    /// Child streams are captured through pipes
    Pipes,
}

/// Liveness of the supervised child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited(i32),
    Signaled(Signal),
}

impl ChildStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ChildStatus::Running)
    }

    /// Exit code the supervisor reports for this child status.
    ///
    /// `128 + signal` for a signaled child, following shell convention.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ChildStatus::Running => None,
            ChildStatus::Exited(code) => Some(*code),
            ChildStatus::Signaled(signal) => Some(128 + *signal as i32),
        }
    }
}

/// Summary of the supervised child once the process tree is drained
#[derive(Debug, Clone)]
pub struct ChildReport {
    pub pid: i32,
    pub status: ChildStatus,
    pub descendants_reaped: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ChildReport {
    /// Exit code for the supervisor itself; 1 if the child was never observed exiting
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code().unwrap_or(1)
    }

    pub fn duration_ms(&self) -> u64 {
        self.completed_at
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

// Child process handle and command construction

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use pidone_core::{ChildStatus, EnvMode, EnvironmentBlock};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What to run and how to prepare its environment
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: EnvironmentBlock,
    pub env_mode: EnvMode,
}

impl ProcessConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: EnvironmentBlock::new(),
            env_mode: EnvMode::default(),
        }
    }

    pub fn with_env(mut self, env: EnvironmentBlock, mode: EnvMode) -> Self {
        self.env = env;
        self.env_mode = mode;
        self
    }

    /// Build the command with its environment applied.
    ///
    /// An empty block leaves the inherited environment untouched in either mode.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(self.resolve_program());
        cmd.args(&self.args);

        if !self.env.is_empty() {
            if self.env_mode == EnvMode::Replace {
                cmd.env_clear();
            }
            cmd.envs(self.env.vars().iter().map(|(k, v)| (k, v)));
        }

        cmd
    }

    /// Resolve the program against the supervisor's own PATH, so that a
    /// replaced environment without PATH can still find it
    fn resolve_program(&self) -> PathBuf {
        match which::which(&self.program) {
            Ok(path) => path,
            Err(e) => {
                debug!(program = %self.program, error = %e, "Program not found on PATH");
                PathBuf::from(&self.program)
            }
        }
    }

    /// Human readable command line for logs and errors
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Process group of the supervised child, the only thing the signal
/// forwarder knows about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup(pub i32);

impl ProcessGroup {
    pub fn signal(&self, sig: Signal) -> nix::Result<()> {
        signal::killpg(Pid::from_raw(self.0), sig)
    }
}

struct ChildInner {
    pid: i32,
    pgid: i32,
    started_at: DateTime<Utc>,
    status: Mutex<ChildStatus>,
}

/// Shared handle to the single supervised child
#[derive(Clone)]
pub struct ChildHandle {
    inner: Arc<ChildInner>,
}

impl ChildHandle {
    pub fn new(pid: i32, pgid: i32) -> Self {
        Self {
            inner: Arc::new(ChildInner {
                pid,
                pgid,
                started_at: Utc::now(),
                status: Mutex::new(ChildStatus::Running),
            }),
        }
    }

    pub fn pid(&self) -> i32 {
        self.inner.pid
    }

    pub fn process_group(&self) -> ProcessGroup {
        ProcessGroup(self.inner.pgid)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn status(&self) -> ChildStatus {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_status(&self, status: ChildStatus) {
        let mut guard = self
            .inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = status;
    }

    /// SIGKILL the child if it has not been reaped yet
    pub fn kill(&self) {
        if !self.status().is_running() {
            debug!(pid = self.pid(), "Child already exited, not killing");
            return;
        }

        info!(pid = self.pid(), "Killing child process");
        match signal::kill(Pid::from_raw(self.pid()), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = self.pid(), error = %e, "Error killing child process"),
        }
    }
}

impl std::fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildHandle")
            .field("pid", &self.inner.pid)
            .field("pgid", &self.inner.pgid)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(pairs: &[(&str, &str)]) -> EnvironmentBlock {
        let mut block = EnvironmentBlock::new();
        for (k, v) in pairs {
            block.push(k.to_string(), v.to_string());
        }
        block
    }

    #[test]
    fn test_replace_mode_clears_inherited_environment() {
        let config = ProcessConfig::new("sh", vec!["-c".into(), "env".into()])
            .with_env(block(&[("API_KEY", "abc")]), EnvMode::Replace);

        let output = config.command().output().unwrap();
        let env = String::from_utf8_lossy(&output.stdout);
        assert!(env.contains("API_KEY=abc"));
        assert!(!env.lines().any(|l| l.starts_with("HOME=")));
    }

    #[test]
    fn test_merge_mode_keeps_inherited_environment() {
        let config = ProcessConfig::new("sh", vec!["-c".into(), "echo $API_KEY:$PATH".into()])
            .with_env(block(&[("API_KEY", "abc")]), EnvMode::Merge);

        let output = config.command().output().unwrap();
        let line = String::from_utf8_lossy(&output.stdout);
        assert!(line.starts_with("abc:"));
        assert!(line.trim().len() > "abc:".len());
    }

    #[test]
    fn test_empty_block_inherits_environment() {
        let config = ProcessConfig::new("sh", vec!["-c".into(), "echo $PATH".into()])
            .with_env(EnvironmentBlock::new(), EnvMode::Replace);

        let output = config.command().output().unwrap();
        assert!(!String::from_utf8_lossy(&output.stdout).trim().is_empty());
    }

    #[test]
    fn test_display_joins_arguments() {
        let config = ProcessConfig::new("echo", vec!["hello".into(), "world".into()]);
        assert_eq!(config.display(), "echo hello world");
    }

    #[test]
    fn test_kill_skips_exited_child() {
        let handle = ChildHandle::new(i32::MAX, i32::MAX);
        handle.set_status(ChildStatus::Exited(0));
        handle.kill();
        assert_eq!(handle.status(), ChildStatus::Exited(0));
    }

    #[test]
    fn test_kill_terminates_running_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let handle = ChildHandle::new(child.id() as i32, child.id() as i32);

        handle.kill();

        use std::os::unix::process::ExitStatusExt;
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }
}

// Non-interactive path: child streams captured through pipes

use nix::unistd::{getpgid, Pid};
use pidone_core::{PidoneError, Result};
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use tracing::{info, warn};

use crate::process::{ChildHandle, ProcessConfig};
use crate::relay::Relay;

/// A child started with piped standard streams
pub struct PipeSession {
    pub child: ChildHandle,
    pub stdin: Relay,
    pub stdout: Relay,
    pub stderr: Relay,
}

/// Start the child in its own process group with piped stdio and relay its
/// streams to the supervisor's.
///
/// When the supervisor's stdin ends (or fails) the child is killed.
pub fn spawn(config: &ProcessConfig) -> Result<PipeSession> {
    spawn_with_io(config, io::stdin(), io::stdout(), io::stderr())
}

/// [`spawn`] with explicit supervisor-side streams
pub fn spawn_with_io<I, O, E>(
    config: &ProcessConfig,
    input: I,
    output: O,
    errors: E,
) -> Result<PipeSession>
where
    I: io::Read + Send + 'static,
    O: io::Write + Send + 'static,
    E: io::Write + Send + 'static,
{
    let mut cmd = config.command();
    cmd.process_group(0)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| PidoneError::SpawnError {
        command: config.display(),
        source,
    })?;

    let child_stdin = child.stdin.take().ok_or(PidoneError::PipeError("stdin"))?;
    let child_stdout = child.stdout.take().ok_or(PidoneError::PipeError("stdout"))?;
    let child_stderr = child.stderr.take().ok_or(PidoneError::PipeError("stderr"))?;

    let pid = child.id() as i32;
    let pgid = match getpgid(Some(Pid::from_raw(pid))) {
        Ok(pgid) => pgid.as_raw(),
        Err(e) => {
            // process_group(0) makes the child its own group leader
            warn!(pid, error = %e, "Error reading child process group, assuming pid");
            pid
        }
    };
    // The std handle is dropped without waiting: the reap loop collects the status.
    drop(child);

    let handle = ChildHandle::new(pid, pgid);
    info!(pid, pgid, command = %config.display(), "Started child with pipes");

    let killer = handle.clone();
    let stdin = Relay::spawn_with("stdin", input, child_stdin, move |result| {
        if let Err(e) = result {
            warn!(error = %e, "Error relaying stdin to child");
        }
        info!("Supervisor stdin closed, terminating child");
        killer.kill();
    })?;
    let stdout = Relay::spawn("stdout", child_stdout, output)?;
    let stderr = Relay::spawn("stderr", child_stderr, errors)?;

    Ok(PipeSession {
        child: handle,
        stdin,
        stdout,
        stderr,
    })
}

// Reaping of the whole descendant tree

use nix::errno::Errno;
use nix::sys::wait::{wait, WaitStatus};
use pidone_core::{ChildStatus, PidoneError, Result};
use tracing::{debug, info, trace};

use crate::process::ChildHandle;

/// Outcome of draining every descendant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub child_status: ChildStatus,
    pub reaped: usize,
}

/// Register the supervisor as the fallback parent of orphaned descendants.
///
/// Not needed when running as PID 1, harmless when it is.
#[cfg(target_os = "linux")]
pub fn become_subreaper() -> Result<()> {
    nix::sys::prctl::set_child_subreaper(true).map_err(|e| PidoneError::IoError(e.into()))?;
    debug!("Registered as child subreaper");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn become_subreaper() -> Result<()> {
    debug!("Child subreaper not supported on this platform");
    Ok(())
}

/// Terminal status carried by a wait result, if any
pub fn terminal_status(status: WaitStatus) -> Option<(i32, ChildStatus)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), ChildStatus::Exited(code))),
        WaitStatus::Signaled(pid, sig, _) => Some((pid.as_raw(), ChildStatus::Signaled(sig))),
        _ => None,
    }
}

/// Block until no descendants remain, reaping every one that exits.
///
/// Orphans re-parented to the supervisor are collected too. The direct
/// child's status is recorded on its handle; other descendants only count.
pub fn reap_all(child: &ChildHandle) -> Result<ReapSummary> {
    let mut reaped = 0;

    loop {
        match wait() {
            Ok(status) => {
                let Some((pid, exit)) = terminal_status(status) else {
                    trace!(status = ?status, "Ignoring non-terminal wait status");
                    continue;
                };
                reaped += 1;

                if pid == child.pid() {
                    info!(pid, status = ?exit, "Child exited");
                    child.set_status(exit);
                } else {
                    debug!(pid, status = ?exit, "Reaped descendant");
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => return Err(PidoneError::WaitError(e)),
        }
    }

    debug!(reaped, "No descendants left");
    Ok(ReapSummary {
        child_status: child.status(),
        reaped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    #[test]
    fn test_terminal_status_exited() {
        let status = WaitStatus::Exited(Pid::from_raw(42), 3);
        assert_eq!(terminal_status(status), Some((42, ChildStatus::Exited(3))));
    }

    #[test]
    fn test_terminal_status_signaled() {
        let status = WaitStatus::Signaled(Pid::from_raw(7), Signal::SIGTERM, false);
        assert_eq!(
            terminal_status(status),
            Some((7, ChildStatus::Signaled(Signal::SIGTERM)))
        );
    }

    #[test]
    fn test_terminal_status_ignores_stops() {
        let status = WaitStatus::Stopped(Pid::from_raw(7), Signal::SIGSTOP);
        assert_eq!(terminal_status(status), None);
        assert_eq!(terminal_status(WaitStatus::StillAlive), None);
    }
}

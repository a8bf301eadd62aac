// Interactive path: the child runs as a session leader on a pseudo-terminal

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use nix::pty::{openpty, Winsize};
use nix::unistd::setsid;
use pidone_core::{PidoneError, Result};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::process::{ChildHandle, ProcessConfig};
use crate::relay::Relay;
use crate::terminal::{inherit_size, RawModeGuard};

nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

/// Propagates the real terminal's size to the pty master
#[derive(Clone)]
pub struct PtyResizer {
    terminal: Arc<OwnedFd>,
    master: Arc<OwnedFd>,
}

impl PtyResizer {
    pub fn resize(&self) -> Result<Winsize> {
        inherit_size(self.terminal.as_fd(), self.master.as_fd())
    }

    /// Resize, logging and ignoring failure
    pub fn sync(&self) {
        if let Err(e) = self.resize() {
            warn!(error = %e, "Error resizing pty");
        }
    }
}

/// A child attached to a pty, with its relays and terminal state.
///
/// The supervisor's terminal stays in raw mode while the session lives. The
/// child's session id doubles as the process group signals are sent to.
///
/// Dropping the session restores the terminal mode and releases the
/// session's reference to the master.
pub struct PtySession {
    pub child: ChildHandle,
    pub resizer: PtyResizer,
    /// pty master to supervisor stdout; ends when the session ends
    pub output: Relay,
    /// supervisor stdin to pty master; may stay blocked on the next keystroke
    pub input: Relay,
    raw_mode: Option<RawModeGuard>,
}

impl PtySession {
    pub fn raw_mode_active(&self) -> bool {
        self.raw_mode.is_some()
    }
}

/// Start the child on a new pty driven by the supervisor's own terminal
pub fn spawn(config: &ProcessConfig) -> Result<PtySession> {
    let stdin = io::stdin();
    spawn_with_terminal(config, stdin.as_fd(), io::stdin(), io::stdout())
}

/// Start the child on a new pty.
///
/// `terminal` is the real terminal: its size is mirrored onto the pty and it
/// is put in raw mode for the session's lifetime. `input` and `output` are
/// the byte streams relayed to and from the pty master.
///
/// Returns [`PidoneError::PtyError`] when no pty can be allocated; the caller
/// may fall back to pipes. Failing to start the child is fatal.
pub fn spawn_with_terminal<R, W>(
    config: &ProcessConfig,
    terminal: BorrowedFd<'_>,
    input: R,
    output: W,
) -> Result<PtySession>
where
    R: io::Read + Send + 'static,
    W: io::Write + Send + 'static,
{
    let pty = openpty(None, None).map_err(PidoneError::PtyError)?;
    let master = pty.master;
    let slave = pty.slave;

    // Neither end may leak into other processes; the child gets the slave
    // through its stdio duplicates only.
    for fd in [&master, &slave] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(PidoneError::PtyError)?;
    }

    let master = Arc::new(master);
    let resizer = PtyResizer {
        terminal: Arc::new(terminal.try_clone_to_owned()?),
        master: master.clone(),
    };
    // Initial sync, before the child can query its size
    resizer.sync();

    let mut cmd = config.command();
    cmd.stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave.try_clone()?));

    // SAFETY: only async-signal-safe calls (setsid, ioctl) run between fork and exec
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(io::Error::from)?;
            tiocsctty(0, 0).map_err(io::Error::from)?;
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| PidoneError::SpawnError {
        command: config.display(),
        source,
    })?;
    let pid = child.id() as i32;
    // Close every parent-side slave descriptor so the master sees EIO once
    // the child's session goes away.
    drop(cmd);
    drop(slave);
    drop(child);

    let handle = ChildHandle::new(pid, pid);
    info!(pid, command = %config.display(), "Started child on pty");

    let raw_mode = match RawModeGuard::acquire(terminal) {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!(error = %e, "Error switching terminal to raw mode");
            None
        }
    };

    let reader = File::from(master.try_clone()?);
    let writer = File::from(master.try_clone()?);
    let input = Relay::spawn("pty-input", input, writer)?;
    let output = Relay::spawn("pty-output", reader, output)?;
    debug!(pid, "Pty relays started");

    Ok(PtySession {
        child: handle,
        resizer,
        output,
        input,
        raw_mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{SignalForwarder, SignalListener};
    use crate::terminal::window_size;
    use nix::sys::signal::Signal;
    use nix::sys::wait::waitpid;
    use nix::unistd::{getpgid, Pid};
    use pidone_core::{ChildStatus, TerminalMode};
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Silent(std::sync::mpsc::Receiver<()>);

    impl io::Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    fn outer_terminal(rows: u16, cols: u16) -> nix::pty::OpenptyResult {
        let size = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        openpty(Some(&size), None).unwrap()
    }

    async fn run_to_end(
        config: &ProcessConfig,
        terminal: &nix::pty::OpenptyResult,
    ) -> (ChildHandle, String) {
        let (_tx, rx) = std::sync::mpsc::channel();
        let out = Capture::default();
        let session =
            spawn_with_terminal(config, terminal.slave.as_fd(), Silent(rx), out.clone()).unwrap();

        waitpid(Pid::from_raw(session.child.pid()), None).unwrap();
        session.child.set_status(ChildStatus::Exited(0));

        let PtySession { child, output, .. } = session;
        tokio::time::timeout(Duration::from_secs(5), output.finished())
            .await
            .expect("pty output relay did not finish")
            .unwrap();

        let text = String::from_utf8_lossy(&out.0.lock().unwrap()).to_string();
        (child, text)
    }

    #[tokio::test]
    async fn test_initial_size_matches_terminal() {
        let terminal = outer_terminal(40, 120);
        let config = ProcessConfig::new("stty", vec!["size".into()]);

        let (_child, text) = run_to_end(&config, &terminal).await;

        assert_eq!(text.trim(), "40 120");
    }

    #[tokio::test]
    async fn test_child_leads_its_own_session() {
        let terminal = outer_terminal(24, 80);
        let config = ProcessConfig::new("sh", vec!["-c".into(), "test -t 0 && echo tty".into()]);

        let (child, text) = run_to_end(&config, &terminal).await;

        assert_eq!(child.process_group().0, child.pid());
        assert_eq!(text.trim(), "tty");
    }

    #[tokio::test]
    async fn test_resize_propagates_new_dimensions() {
        let terminal = outer_terminal(24, 80);
        let (_tx, rx) = std::sync::mpsc::channel();
        let config = ProcessConfig::new("sleep", vec!["5".into()]);
        let session =
            spawn_with_terminal(&config, terminal.slave.as_fd(), Silent(rx), Capture::default())
                .unwrap();

        let bigger = Winsize {
            ws_row: 50,
            ws_col: 200,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        crate::terminal::set_window_size(terminal.master.as_fd(), &bigger).unwrap();
        let applied = session.resizer.resize().unwrap();
        assert_eq!((applied.ws_row, applied.ws_col), (50, 200));

        assert_eq!(
            getpgid(Some(Pid::from_raw(session.child.pid()))).unwrap().as_raw(),
            session.child.pid()
        );
        session.child.kill();
        waitpid(Pid::from_raw(session.child.pid()), None).unwrap();
    }

    #[tokio::test]
    async fn test_raw_mode_restored_when_session_dropped() {
        use nix::sys::termios::{tcgetattr, LocalFlags};

        let terminal = outer_terminal(24, 80);
        let (_tx, rx) = std::sync::mpsc::channel();
        let config = ProcessConfig::new("sleep", vec!["5".into()]);
        let session =
            spawn_with_terminal(&config, terminal.slave.as_fd(), Silent(rx), Capture::default())
                .unwrap();

        assert!(session.raw_mode_active());
        let during = tcgetattr(&terminal.slave).unwrap();
        assert!(!during.local_flags.contains(LocalFlags::ICANON));

        let pid = session.child.pid();
        session.child.kill();
        waitpid(Pid::from_raw(pid), None).unwrap();
        drop(session);

        let after = tcgetattr(&terminal.slave).unwrap();
        assert!(after.local_flags.contains(LocalFlags::ICANON));
    }

    #[tokio::test]
    async fn test_sigwinch_through_forwarder_resizes_pty() {
        let terminal = outer_terminal(24, 80);
        let (_tx, rx) = std::sync::mpsc::channel();
        let config = ProcessConfig::new("sleep", vec!["5".into()]);
        let session =
            spawn_with_terminal(&config, terminal.slave.as_fd(), Silent(rx), Capture::default())
                .unwrap();

        let resized = Winsize {
            ws_row: 60,
            ws_col: 180,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        crate::terminal::set_window_size(terminal.master.as_fd(), &resized).unwrap();

        let (signals, received) = tokio::sync::mpsc::unbounded_channel();
        signals.send(Signal::SIGWINCH).unwrap();
        drop(signals);
        let forwarder =
            SignalForwarder::new(session.child.process_group(), TerminalMode::Interactive)
                .with_resizer(session.resizer.clone());
        let stats = forwarder.run(SignalListener::from_channel(received)).await;

        assert_eq!(stats.resized, 1);
        assert_eq!(stats.forwarded, 0);
        let size = window_size(session.resizer.master.as_fd()).unwrap();
        assert_eq!((size.ws_row, size.ws_col), (60, 180));

        session.child.kill();
        waitpid(Pid::from_raw(session.child.pid()), None).unwrap();
    }
}

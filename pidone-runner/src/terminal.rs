// Terminal mode selection, raw mode and window size

use nix::libc;
use nix::pty::Winsize;
use nix::sys::termios::{self, SetArg, Termios};
use pidone_core::{PidoneError, Result, TerminalMode};
use std::io::IsTerminal;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use tracing::{debug, warn};

nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, Winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

/// Pick the relay path from whether the supervisor's stdout is a terminal
pub fn select_mode<T: IsTerminal>(stdout: &T) -> TerminalMode {
    if stdout.is_terminal() {
        TerminalMode::Interactive
    } else {
        TerminalMode::Pipes
    }
}

/// Mode for the current process's standard output
pub fn detect_mode() -> TerminalMode {
    select_mode(&std::io::stdout())
}

/// Keeps a terminal in raw mode until dropped.
///
/// Dropping restores the attributes captured at acquisition. Restoration is
/// best-effort; a failure is logged.
pub struct RawModeGuard {
    fd: OwnedFd,
    original: Termios,
}

impl RawModeGuard {
    /// Put `fd` in raw mode. The descriptor is duplicated so the guard does
    /// not depend on the caller keeping it open.
    pub fn acquire<Fd: AsFd>(fd: Fd) -> Result<Self> {
        let fd = fd
            .as_fd()
            .try_clone_to_owned()
            .map_err(PidoneError::IoError)?;
        let original = termios::tcgetattr(&fd).map_err(PidoneError::TerminalError)?;

        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&fd, SetArg::TCSANOW, &raw).map_err(PidoneError::TerminalError)?;

        debug!(fd = fd.as_raw_fd(), "Terminal switched to raw mode");
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(&self.fd, SetArg::TCSANOW, &self.original) {
            warn!(error = %e, "Error restoring terminal mode");
        } else {
            debug!("Terminal mode restored");
        }
    }
}

/// Read the window size of the terminal behind `fd`
pub fn window_size(fd: BorrowedFd<'_>) -> Result<Winsize> {
    let mut size = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `size` is a live, writable winsize for the whole call
    unsafe { tiocgwinsz(fd.as_raw_fd(), &mut size) }.map_err(PidoneError::TerminalError)?;
    Ok(size)
}

/// Apply a window size to the terminal behind `fd`
pub fn set_window_size(fd: BorrowedFd<'_>, size: &Winsize) -> Result<()> {
    // SAFETY: TIOCSWINSZ only reads the borrowed winsize
    unsafe { tiocswinsz(fd.as_raw_fd(), size) }.map_err(PidoneError::TerminalError)?;
    Ok(())
}

/// Copy the window size of `from` onto `to`
pub fn inherit_size(from: BorrowedFd<'_>, to: BorrowedFd<'_>) -> Result<Winsize> {
    let size = window_size(from)?;
    set_window_size(to, &size)?;
    debug!(rows = size.ws_row, cols = size.ws_col, "Propagated window size");
    Ok(size)
}

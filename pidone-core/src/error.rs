use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PidoneError {
    #[error("Credential provider error: {0}")]
    CredentialError(String),

    #[error("PTY allocation error: {0}")]
    PtyError(#[source] Errno),

    #[error("Terminal error: {0}")]
    TerminalError(#[source] Errno),

    #[error("Failed to start '{command}': {source}")]
    SpawnError {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to capture child {0} pipe")]
    PipeError(&'static str),

    #[error("Failed to start signal listener: {0}")]
    SubscribeError(#[source] std::io::Error),

    #[error("Failed to deliver {signal:?} to process group {pgid}: {source}")]
    SignalError {
        signal: Signal,
        pgid: i32,
        #[source]
        source: Errno,
    },

    #[error("Wait error: {0}")]
    WaitError(#[source] Errno),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl PidoneError {
    /// Whether the supervisor has to abort instead of degrading.
    ///
    /// Only failures that leave no viable child are fatal; everything else
    /// is logged and execution continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PidoneError::SpawnError { .. }
                | PidoneError::PipeError(_)
                | PidoneError::InvalidConfiguration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PidoneError>;

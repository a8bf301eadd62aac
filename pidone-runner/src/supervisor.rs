// Lifecycle controller: start, supervise and reap one child

use chrono::Utc;
use pidone_core::{ChildReport, EnvMode, PidoneError, Result, TerminalMode};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::environment::{load_environment, CredentialProvider, SecretsDirProvider, DEFAULT_SECRETS_DIR};
use crate::pipe::{self, PipeSession};
use crate::process::{ChildHandle, ProcessConfig};
use crate::pty::{self, PtySession};
use crate::reaper::{become_subreaper, reap_all};
use crate::relay::Relay;
use crate::signals::{SignalForwarder, SignalListener};
use crate::terminal::detect_mode;

/// Default time allowed for relays to flush once every descendant is gone
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Supervisor settings, built by the caller from its own configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub secrets_dir: PathBuf,
    pub env_mode: EnvMode,
    pub subreaper: bool,
    pub drain_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            secrets_dir: PathBuf::from(DEFAULT_SECRETS_DIR),
            env_mode: EnvMode::default(),
            subreaper: true,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// A started child with the relays serving it
enum Session {
    Pty(PtySession),
    Pipes(PipeSession),
}

impl Session {
    fn child(&self) -> &ChildHandle {
        match self {
            Session::Pty(session) => &session.child,
            Session::Pipes(session) => &session.child,
        }
    }

    fn mode(&self) -> TerminalMode {
        match self {
            Session::Pty(_) => TerminalMode::Interactive,
            Session::Pipes(_) => TerminalMode::Pipes,
        }
    }
}

/// Runs one child as a surrogate init until its whole process tree is gone
pub struct Supervisor {
    config: SupervisorConfig,
    provider: Box<dyn CredentialProvider + Send + Sync>,
    mode: Option<TerminalMode>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let provider = Box::new(SecretsDirProvider::new(&config.secrets_dir));
        Self {
            config,
            provider,
            mode: None,
        }
    }

    pub fn with_provider<P>(mut self, provider: P) -> Self
    where
        P: CredentialProvider + Send + Sync + 'static,
    {
        self.provider = Box::new(provider);
        self
    }

    /// Force a terminal mode instead of inspecting stdout
    pub fn with_mode(mut self, mode: TerminalMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Build the child's process configuration from the credential provider
    pub fn process_config(&self) -> ProcessConfig {
        let env = load_environment(self.provider.as_ref());
        ProcessConfig::new(self.config.program.clone(), self.config.args.clone())
            .with_env(env, self.config.env_mode)
    }

    /// Start the child, forward signals to it and block until every
    /// descendant has been reaped.
    ///
    /// Terminal state is restored before this returns, on success and error.
    pub async fn run(&self) -> Result<ChildReport> {
        let process = self.process_config();

        if self.config.subreaper {
            if let Err(e) = become_subreaper() {
                warn!(error = %e, "Orphaned descendants may not be reaped");
            }
        }

        // Subscribe before the child exists so no signal is missed
        let listener = SignalListener::subscribe()?;

        let mode = self.mode.unwrap_or_else(detect_mode);
        let session = start(&process, mode)?;
        let child = session.child().clone();

        info!(
            pid = child.pid(),
            mode = ?session.mode(),
            command = %process.display(),
            "Supervising child"
        );

        let mut forwarder = SignalForwarder::new(child.process_group(), session.mode());
        if let Session::Pty(pty) = &session {
            forwarder = forwarder.with_resizer(pty.resizer.clone());
        }
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let forwarder = tokio::spawn(forwarder.run_until(listener, async {
            let _ = stop_rx.await;
        }));

        let reap_child = child.clone();
        let summary = tokio::task::spawn_blocking(move || reap_all(&reap_child))
            .await
            .map_err(|e| PidoneError::IoError(io::Error::new(io::ErrorKind::Other, e)))?;

        drain(session, self.config.drain_timeout).await;
        let _ = stop_tx.send(());
        match forwarder.await {
            Ok(stats) => debug!(stats = ?stats, "Signal forwarding finished"),
            Err(e) => warn!(error = %e, "Signal forwarder task failed"),
        }

        let summary = summary?;
        let report = ChildReport {
            pid: child.pid(),
            status: summary.child_status,
            descendants_reaped: summary.reaped,
            started_at: child.started_at(),
            completed_at: Utc::now(),
        };

        info!(
            pid = report.pid,
            status = ?report.status,
            exit_code = report.exit_code(),
            duration_ms = report.duration_ms(),
            reaped = report.descendants_reaped,
            "Supervision completed"
        );

        Ok(report)
    }
}

/// Start the child under `mode`. A pty that cannot be allocated degrades to pipes.
fn start(process: &ProcessConfig, mode: TerminalMode) -> Result<Session> {
    start_with(mode, || pty::spawn(process), || pipe::spawn(process))
}

fn start_with<P, Q>(mode: TerminalMode, spawn_pty: P, spawn_pipes: Q) -> Result<Session>
where
    P: FnOnce() -> Result<PtySession>,
    Q: FnOnce() -> Result<PipeSession>,
{
    if mode == TerminalMode::Interactive {
        match spawn_pty() {
            Ok(session) => return Ok(Session::Pty(session)),
            Err(e @ PidoneError::PtyError(_)) => {
                warn!(error = %e, "Error allocating pty, falling back to pipes");
            }
            Err(e) => return Err(e),
        }
    }

    spawn_pipes().map(Session::Pipes)
}

/// Let the output relays flush, bounded by `timeout`, then tear the session
/// down. The input relay is abandoned.
async fn drain(session: Session, timeout: Duration) {
    match session {
        Session::Pty(session) => {
            let PtySession { output, .. } = session;
            wait_relay(output, timeout).await;
        }
        Session::Pipes(session) => {
            let PipeSession { stdout, stderr, .. } = session;
            tokio::join!(wait_relay(stdout, timeout), wait_relay(stderr, timeout));
        }
    }
}

async fn wait_relay(relay: Relay, timeout: Duration) {
    let name = relay.name();
    match tokio::time::timeout(timeout, relay.finished()).await {
        Ok(Ok(bytes)) => debug!(relay = name, bytes, "Relay drained"),
        Ok(Err(e)) => error!(relay = name, error = %e, "Relay ended with error"),
        Err(_) => warn!(relay = name, "Relay still open after the last descendant exited"),
    }
}

// Signal listener and forwarder for the supervised process group

use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use pidone_core::{PidoneError, Result, TerminalMode};
use std::future::Future;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::process::ProcessGroup;
use crate::pty::PtyResizer;

/// Signals that cannot or should not be caught: uncatchable ones, synchronous
/// faults, and SIGPIPE raised by the supervisor's own writes.
const UNSUBSCRIBED: [Signal; 8] = [
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGTRAP,
    Signal::SIGPIPE,
];

/// Every signal the listener subscribes to
pub fn subscribed_signals() -> Vec<Signal> {
    Signal::iterator()
        .filter(|sig| !UNSUBSCRIBED.contains(sig))
        .collect()
}

/// What the forwarder does with a received signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Forward,
    Resize,
    Suppress,
}

pub fn route(sig: Signal, mode: TerminalMode) -> Route {
    match (sig, mode) {
        (Signal::SIGCHLD, _) => Route::Suppress,
        (Signal::SIGWINCH, TerminalMode::Interactive) => Route::Resize,
        _ => Route::Forward,
    }
}

fn signal_set(signals: &[Signal]) -> SigSet {
    let mut set = SigSet::empty();
    for &sig in signals {
        set.add(sig);
    }
    set
}

/// Block every subscribed signal in the calling thread.
///
/// Must run on the main thread before any other thread is started: threads
/// inherit the mask, so afterwards only the listener ever takes these
/// signals. Children get a clean mask from `Command`.
pub fn block_signals() -> Result<()> {
    signal_set(&subscribed_signals())
        .thread_block()
        .map_err(|e| PidoneError::SubscribeError(e.into()))?;
    debug!("Blocked subscribed signals");
    Ok(())
}

/// The single owner of the process's signal subscriptions.
///
/// A dedicated thread takes each signal with `sigwait` and queues it on an
/// unbounded channel, so every delivery is kept and kept in order. Signals
/// arriving before a forwarder consumes the listener wait in the channel.
pub struct SignalListener {
    rx: mpsc::UnboundedReceiver<Signal>,
    waiter: Option<thread::JoinHandle<()>>,
}

impl SignalListener {
    /// Listen for every catchable signal. See [`block_signals`].
    pub fn subscribe() -> Result<Self> {
        Self::subscribe_to(&subscribed_signals())
    }

    pub fn subscribe_to(signals: &[Signal]) -> Result<Self> {
        let set = signal_set(signals);
        let (tx, rx) = mpsc::unbounded_channel();

        // The waiter must start with the signals already blocked
        let previous = set
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .map_err(|e| PidoneError::SubscribeError(e.into()))?;
        let spawned = thread::Builder::new()
            .name("signal-listener".to_string())
            .spawn(move || wait_loop(set, tx));
        if let Err(e) = previous.thread_set_mask() {
            warn!(error = %e, "Error restoring signal mask");
        }
        let waiter = spawned.map_err(PidoneError::SubscribeError)?;

        debug!(count = signals.len(), "Subscribed to signals");
        Ok(Self {
            rx,
            waiter: Some(waiter),
        })
    }

    /// Listener fed from an existing channel instead of OS signals
    pub fn from_channel(rx: mpsc::UnboundedReceiver<Signal>) -> Self {
        Self { rx, waiter: None }
    }

    /// Whether a listener thread is still taking OS signals
    pub fn is_listening(&self) -> bool {
        self.waiter.as_ref().is_some_and(|waiter| !waiter.is_finished())
    }

    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

fn wait_loop(set: SigSet, tx: mpsc::UnboundedSender<Signal>) {
    loop {
        match set.wait() {
            Ok(sig) => {
                trace!(signal = ?sig, "Signal received");
                if tx.send(sig).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Error waiting for signals, listener stopped");
                break;
            }
        }
    }
}

/// Counters reported when the forwarder stops listening
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub forwarded: usize,
    pub resized: usize,
    pub suppressed: usize,
}

/// Relays received signals to the child's process group
pub struct SignalForwarder {
    group: ProcessGroup,
    mode: TerminalMode,
    resizer: Option<PtyResizer>,
    stats: ForwarderStats,
}

impl SignalForwarder {
    pub fn new(group: ProcessGroup, mode: TerminalMode) -> Self {
        Self {
            group,
            mode,
            resizer: None,
            stats: ForwarderStats::default(),
        }
    }

    pub fn with_resizer(mut self, resizer: PtyResizer) -> Self {
        self.resizer = Some(resizer);
        self
    }

    /// Handle one signal
    pub fn dispatch(&mut self, sig: Signal) -> Route {
        let route = route(sig, self.mode);
        match route {
            Route::Suppress => {
                trace!(signal = ?sig, "Child status changed");
                self.stats.suppressed += 1;
            }
            Route::Resize => {
                if let Some(resizer) = &self.resizer {
                    resizer.sync();
                }
                self.stats.resized += 1;
            }
            Route::Forward => {
                if let Err(e) = self.forward(sig) {
                    warn!(error = %e, "Error forwarding signal");
                }
                self.stats.forwarded += 1;
            }
        }
        route
    }

    fn forward(&self, sig: Signal) -> Result<()> {
        debug!(signal = ?sig, pgid = self.group.0, "Forwarding signal");
        match self.group.signal(sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!(signal = ?sig, pgid = self.group.0, "Process group already gone");
                Ok(())
            }
            Err(source) => Err(PidoneError::SignalError {
                signal: sig,
                pgid: self.group.0,
                source,
            }),
        }
    }

    /// Forward signals until the listener's stream ends
    pub async fn run(self, listener: SignalListener) -> ForwarderStats {
        self.run_until(listener, std::future::pending()).await
    }

    /// Forward signals until `shutdown` resolves or the stream ends
    pub async fn run_until<F>(mut self, mut listener: SignalListener, shutdown: F) -> ForwarderStats
    where
        F: Future<Output = ()>,
    {
        info!(
            pgid = self.group.0,
            mode = ?self.mode,
            os_signals = listener.is_listening(),
            "Signal forwarder listening"
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                sig = listener.recv() => match sig {
                    Some(sig) => {
                        self.dispatch(sig);
                    }
                    None => break,
                },
            }
        }

        info!(stats = ?self.stats, "Signal forwarder terminated");
        self.stats
    }
}

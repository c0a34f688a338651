//! [`SignalBridge`] – OS signals as queued broker commands.
//!
//! Each watched signal gets its own task that forwards every delivery as
//! [`BrokerCommand::Signal`][capd_middleware::BrokerCommand::Signal].  No
//! broker state is touched in signal context; a second delivery simply
//! queues a second command, which the broker turns into a forced kill.
//!
//! Tokio refuses to install handlers for SIGSEGV (and the other signals a
//! process cannot safely return from), so a segmentation fault terminates
//! the broker without the shutdown sequence.  Refused registrations passed
//! to [`SignalBridge::install_for`] are logged and the remaining signals
//! are still watched.

use capd_middleware::BrokerHandle;
use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signals that start the shutdown sequence.
pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGBUS];

pub struct SignalBridge {
    watched: Vec<Signal>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalBridge {
    /// Watch [`SHUTDOWN_SIGNALS`].  Must be called from within a Tokio
    /// runtime.
    pub fn install(handle: BrokerHandle) -> Self {
        Self::install_for(&SHUTDOWN_SIGNALS, handle)
    }

    /// Watch an explicit set of signals.
    pub fn install_for(signals: &[Signal], handle: BrokerHandle) -> Self {
        let mut watched = Vec::with_capacity(signals.len());
        let mut tasks = Vec::with_capacity(signals.len());
        for &sig in signals {
            let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(signal = sig.as_str(), error = %e, "failed to register signal handler");
                    continue;
                }
            };
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    info!(signal = sig.as_str(), "received signal");
                    if handle.signal(sig as i32).await.is_err() {
                        debug!(signal = sig.as_str(), "broker gone, signal bridge exiting");
                        break;
                    }
                }
            }));
            watched.push(sig);
        }
        info!(signals = ?watched, "signal bridge started");
        Self { watched, tasks }
    }

    /// Signals that actually got a handler.
    pub fn watched(&self) -> &[Signal] {
        &self.watched
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

//! [`ShutdownCoordinator`] – decides what a shutdown request means.
//!
//! The coordinator is a three-state machine:
//!
//! | Phase | On a local request | On a bus request |
//! |---|---|---|
//! | [`ShutdownPhase::Running`] | [`ShutdownAction::Begin`], move to `Stopping` | [`ShutdownAction::Rejected`] |
//! | [`ShutdownPhase::Stopping`] | [`ShutdownAction::ForceKill`] | [`ShutdownAction::Rejected`] |
//! | [`ShutdownPhase::Terminated`] | [`ShutdownAction::ForceKill`] | [`ShutdownAction::Rejected`] |
//!
//! The teardown itself is carried out by the caller; the coordinator only
//! guarantees it is started at most once.

use capd_types::ClientId;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Stopping,
    Terminated,
}

/// Where a shutdown request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOrigin {
    /// The process received this signal number.
    Signal(i32),
    /// A bus client asked the broker to exit with this code.
    Bus { client: ClientId, exit_code: i32 },
}

/// What the caller must do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// Run the teardown sequence, then exit with `exit_code`.
    Begin { exit_code: i32 },
    /// Teardown is already under way; kill the process outright.
    ForceKill,
    /// The request is not honoured.
    Rejected,
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    phase: ShutdownPhase,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            phase: ShutdownPhase::Running,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    /// Classify a shutdown request and advance the phase.
    pub fn request(&mut self, origin: ShutdownOrigin) -> ShutdownAction {
        match origin {
            ShutdownOrigin::Bus { client, exit_code } => {
                warn!(client = %client, exit_code, "rejected shutdown request from bus client");
                ShutdownAction::Rejected
            }
            ShutdownOrigin::Signal(signal) => match self.phase {
                ShutdownPhase::Running => {
                    info!(signal, "shutdown requested");
                    self.phase = ShutdownPhase::Stopping;
                    ShutdownAction::Begin { exit_code: signal }
                }
                ShutdownPhase::Stopping | ShutdownPhase::Terminated => {
                    warn!(signal, "already shutting down, forcing stop");
                    ShutdownAction::ForceKill
                }
            },
        }
    }

    /// Mark the teardown sequence as complete.
    pub fn finish(&mut self) {
        self.phase = ShutdownPhase::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGTERM: i32 = 15;
    const SIGINT: i32 = 2;

    #[test]
    fn starts_running() {
        assert_eq!(ShutdownCoordinator::new().phase(), ShutdownPhase::Running);
    }

    #[test]
    fn first_signal_begins_teardown_with_signal_as_exit_code() {
        let mut coord = ShutdownCoordinator::new();
        assert_eq!(
            coord.request(ShutdownOrigin::Signal(SIGTERM)),
            ShutdownAction::Begin { exit_code: SIGTERM }
        );
        assert_eq!(coord.phase(), ShutdownPhase::Stopping);
    }

    #[test]
    fn second_signal_while_stopping_forces_kill() {
        let mut coord = ShutdownCoordinator::new();
        coord.request(ShutdownOrigin::Signal(SIGTERM));
        assert_eq!(coord.request(ShutdownOrigin::Signal(SIGINT)), ShutdownAction::ForceKill);
        assert_eq!(coord.phase(), ShutdownPhase::Stopping);
    }

    #[test]
    fn signal_after_finish_forces_kill() {
        let mut coord = ShutdownCoordinator::new();
        coord.request(ShutdownOrigin::Signal(SIGINT));
        coord.finish();
        assert_eq!(coord.phase(), ShutdownPhase::Terminated);
        assert_eq!(coord.request(ShutdownOrigin::Signal(SIGINT)), ShutdownAction::ForceKill);
    }

    #[test]
    fn bus_request_is_always_rejected() {
        let mut coord = ShutdownCoordinator::new();
        let origin = ShutdownOrigin::Bus {
            client: ClientId::from(":1.8"),
            exit_code: 0,
        };
        assert_eq!(coord.request(origin.clone()), ShutdownAction::Rejected);
        assert_eq!(coord.phase(), ShutdownPhase::Running);

        coord.request(ShutdownOrigin::Signal(SIGTERM));
        assert_eq!(coord.request(origin), ShutdownAction::Rejected);
    }
}

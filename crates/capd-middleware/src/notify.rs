//! Init-system notifications (sd_notify protocol).
//!
//! With the `systemd` feature (on by default in the `capd` binary),
//! [`SystemdNotifier`] writes to the notification socket through libsystemd
//! and reads the watchdog deadline from `WATCHDOG_USEC` / `WATCHDOG_PID` the
//! same way `sd_watchdog_enabled(3)` does.
//!
//! A build without the feature cannot reach the socket: notifications are
//! dropped, no watchdog is armed, and
//! [`check_supervision`][SystemdNotifier::check_supervision] warns when the
//! process was started by a supervisor that expects them.

use std::time::Duration;

use capd_types::BrokerError;
use tracing::warn;

/// A single sd_notify assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyState {
    /// `STATUS=<text>`
    Status(String),
    /// `READY=1`
    Ready,
    /// `STOPPING=1`
    Stopping,
    /// `WATCHDOG=1`
    Watchdog,
}

impl NotifyState {
    /// The `KEY`, `VALUE` pair sent over the socket.
    pub fn pair(&self) -> (&'static str, &str) {
        match self {
            NotifyState::Status(text) => ("STATUS", text.as_str()),
            NotifyState::Ready => ("READY", "1"),
            NotifyState::Stopping => ("STOPPING", "1"),
            NotifyState::Watchdog => ("WATCHDOG", "1"),
        }
    }
}

/// What the broker needs from its supervisor.
pub trait InitNotifier: Send + Sync {
    /// Send one state assignment.
    fn notify(&self, state: &NotifyState) -> Result<(), BrokerError>;

    /// The watchdog deadline the supervisor expects heartbeats within, or
    /// `None` when no watchdog is configured for this process.
    fn watchdog_deadline(&self) -> Result<Option<Duration>, BrokerError>;
}

/// `true` when this build can talk to the notification socket.
pub const fn notify_supported() -> bool {
    cfg!(feature = "systemd")
}

/// [`InitNotifier`] for systemd.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemdNotifier;

impl SystemdNotifier {
    /// Warn when a supervisor expects notifications this build cannot send.
    pub fn check_supervision(&self) {
        if let Some(message) = unsupported_supervision(std::env::var_os("NOTIFY_SOCKET").is_some()) {
            warn!("{message}");
        }
    }
}

fn unsupported_supervision(socket_set: bool) -> Option<&'static str> {
    (socket_set && !notify_supported()).then_some(
        "NOTIFY_SOCKET is set but capd was built without the systemd feature; \
         readiness, status and watchdog notifications will not be sent",
    )
}

impl InitNotifier for SystemdNotifier {
    #[cfg(feature = "systemd")]
    fn notify(&self, state: &NotifyState) -> Result<(), BrokerError> {
        let assignment = [state.pair()];
        systemd::daemon::notify(false, assignment.iter())
            .map_err(|e| BrokerError::Notify(e.to_string()))?;
        Ok(())
    }

    #[cfg(not(feature = "systemd"))]
    fn notify(&self, state: &NotifyState) -> Result<(), BrokerError> {
        let (key, value) = state.pair();
        tracing::trace!(key, value, "sd_notify disabled at build time");
        Ok(())
    }

    #[cfg(feature = "systemd")]
    fn watchdog_deadline(&self) -> Result<Option<Duration>, BrokerError> {
        watchdog_from_env(
            std::env::var("WATCHDOG_USEC").ok().as_deref(),
            std::env::var("WATCHDOG_PID").ok().as_deref(),
            std::process::id(),
        )
    }

    /// Heartbeats could not be delivered, so none are scheduled.
    #[cfg(not(feature = "systemd"))]
    fn watchdog_deadline(&self) -> Result<Option<Duration>, BrokerError> {
        Ok(None)
    }
}

/// Interpret the watchdog environment for the process `own_pid`.
///
/// `WATCHDOG_PID`, when present, must name this process; a watchdog meant
/// for another process (e.g. a parent shell script) is ignored.
pub fn watchdog_from_env(
    usec: Option<&str>,
    pid: Option<&str>,
    own_pid: u32,
) -> Result<Option<Duration>, BrokerError> {
    let Some(usec) = usec else {
        return Ok(None);
    };
    if let Some(pid) = pid {
        let pid: u32 = pid
            .trim()
            .parse()
            .map_err(|e| BrokerError::Notify(format!("invalid WATCHDOG_PID {pid:?}: {e}")))?;
        if pid != own_pid {
            return Ok(None);
        }
    }
    let usec: u64 = usec
        .trim()
        .parse()
        .map_err(|e| BrokerError::Notify(format!("invalid WATCHDOG_USEC {usec:?}: {e}")))?;
    if usec == 0 {
        return Err(BrokerError::Notify("WATCHDOG_USEC is zero".to_string()));
    }
    Ok(Some(Duration::from_micros(usec)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_as_sd_notify_pairs() {
        assert_eq!(NotifyState::Ready.pair(), ("READY", "1"));
        assert_eq!(NotifyState::Stopping.pair(), ("STOPPING", "1"));
        assert_eq!(NotifyState::Watchdog.pair(), ("WATCHDOG", "1"));
        assert_eq!(
            NotifyState::Status("running".to_string()).pair(),
            ("STATUS", "running")
        );
    }

    #[test]
    fn no_watchdog_without_usec() {
        assert_eq!(watchdog_from_env(None, None, 100).unwrap(), None);
        assert_eq!(watchdog_from_env(None, Some("100"), 100).unwrap(), None);
    }

    #[test]
    fn watchdog_for_this_process() {
        assert_eq!(
            watchdog_from_env(Some("30000000"), Some("100"), 100).unwrap(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn watchdog_without_pid_applies_to_us() {
        assert_eq!(
            watchdog_from_env(Some("500000"), None, 100).unwrap(),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn watchdog_for_other_process_is_ignored() {
        assert_eq!(watchdog_from_env(Some("30000000"), Some("7"), 100).unwrap(), None);
    }

    #[test]
    fn malformed_watchdog_env_is_an_error() {
        assert!(watchdog_from_env(Some("soon"), None, 1).is_err());
        assert!(watchdog_from_env(Some("1000"), Some("me"), 1).is_err());
        assert!(watchdog_from_env(Some("0"), None, 1).is_err());
    }

    #[test]
    fn supervision_warning_only_when_socket_unreachable() {
        assert_eq!(unsupported_supervision(false), None);
        assert_eq!(unsupported_supervision(true).is_some(), !notify_supported());
    }

    #[cfg(not(feature = "systemd"))]
    #[test]
    fn build_without_systemd_arms_no_watchdog() {
        assert_eq!(SystemdNotifier.watchdog_deadline().unwrap(), None);
    }

    #[test]
    fn notify_without_socket_succeeds() {
        // No NOTIFY_SOCKET in the test environment: nothing to send to.
        assert!(SystemdNotifier.notify(&NotifyState::Ready).is_ok());
    }
}

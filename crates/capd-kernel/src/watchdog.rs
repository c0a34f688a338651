//! [`HeartbeatSchedule`] – keeps the init system's watchdog fed.
//!
//! The init system declares a deadline; missing it gets the broker killed
//! and restarted.  Heartbeats are sent at half the deadline so a single late
//! tick does not breach it.
//!
//! The schedule also remembers when the last heartbeat went out, so the
//! supervisor can tell whether the event loop stalled for longer than the
//! deadline between two ticks.

use std::time::{Duration, Instant};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Whether heartbeats are keeping up with the declared deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// The last heartbeat went out within the deadline.
    Healthy,
    /// More time than the deadline has passed since the last heartbeat.
    Overdue,
}

// ────────────────────────────────────────────────────────────────────────────
// HeartbeatSchedule
// ────────────────────────────────────────────────────────────────────────────

/// Heartbeat timing derived from the init system's watchdog deadline.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use capd_kernel::watchdog::{HeartbeatSchedule, Liveness};
///
/// let schedule = HeartbeatSchedule::new(Duration::from_secs(30)).unwrap();
/// assert_eq!(schedule.period(), Duration::from_secs(15));
/// assert_eq!(schedule.liveness(), Liveness::Healthy);
/// ```
#[derive(Debug)]
pub struct HeartbeatSchedule {
    deadline: Duration,
    period: Duration,
    last_beat: Instant,
}

impl HeartbeatSchedule {
    /// Build a schedule for `deadline`.
    ///
    /// Returns `None` when half the deadline rounds to zero, since no timer
    /// can run at that period.
    pub fn new(deadline: Duration) -> Option<Self> {
        let period = deadline / 2;
        if period.is_zero() {
            return None;
        }
        Some(Self {
            deadline,
            period,
            last_beat: Instant::now(),
        })
    }

    /// The deadline declared by the init system.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// How often a heartbeat should be sent.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Record that a heartbeat was just sent.
    pub fn record_beat(&mut self) {
        self.last_beat = Instant::now();
    }

    /// [`Liveness`] measured against the last recorded heartbeat.
    pub fn liveness(&self) -> Liveness {
        if self.last_beat.elapsed() <= self.deadline {
            Liveness::Healthy
        } else {
            Liveness::Overdue
        }
    }
}

/// Render `d` as `H:MM:SS.mmm` for log lines.
pub fn format_interval(d: Duration) -> String {
    let total_ms = d.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1_000) % 60;
    let millis = total_ms % 1_000;
    format!("{hours}:{minutes:02}:{seconds:02}.{millis:03}")
}

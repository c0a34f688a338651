//! [`LivenessSupervisor`] – drives the watchdog heartbeat.
//!
//! The supervisor asks the [`InitNotifier`] for the watchdog deadline once,
//! at startup.  With no deadline it stays idle forever: [`tick`] never
//! completes, so the broker task can always include it in its `select!`.
//!
//! [`tick`]: LivenessSupervisor::tick

use std::time::Duration;

use capd_kernel::{HeartbeatSchedule, Liveness, format_interval};
use capd_middleware::{InitNotifier, NotifyState};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

struct Heartbeat {
    schedule: HeartbeatSchedule,
    interval: Interval,
}

pub struct LivenessSupervisor {
    heartbeat: Option<Heartbeat>,
}

impl LivenessSupervisor {
    /// Query the watchdog deadline and arm the heartbeat timer if there is
    /// one.  Must be called from within a Tokio runtime.
    pub fn start(notifier: &dyn InitNotifier) -> Self {
        match notifier.watchdog_deadline() {
            Ok(Some(deadline)) => Self::for_deadline(deadline),
            Ok(None) => {
                info!("no watchdog configured, heartbeat disabled");
                Self::idle()
            }
            Err(e) => {
                warn!(error = %e, "could not query watchdog deadline, heartbeat disabled");
                Self::idle()
            }
        }
    }

    /// Arm the heartbeat for an explicit `deadline`.
    pub fn for_deadline(deadline: Duration) -> Self {
        let Some(schedule) = HeartbeatSchedule::new(deadline) else {
            error!(
                deadline = %format_interval(deadline),
                "watchdog deadline too short to schedule a heartbeat, continuing without one"
            );
            return Self::idle();
        };
        info!(
            deadline = %format_interval(schedule.deadline()),
            period = %format_interval(schedule.period()),
            "watchdog heartbeat scheduled"
        );
        let mut interval = tokio::time::interval(schedule.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            heartbeat: Some(Heartbeat { schedule, interval }),
        }
    }

    /// A supervisor that never ticks.
    pub fn idle() -> Self {
        Self { heartbeat: None }
    }

    pub fn is_armed(&self) -> bool {
        self.heartbeat.is_some()
    }

    /// Heartbeat period, when armed.
    pub fn period(&self) -> Option<Duration> {
        self.heartbeat.as_ref().map(|h| h.schedule.period())
    }

    /// Wait for the next heartbeat.  Pending forever when idle.  Cancel safe.
    pub async fn tick(&mut self) {
        match self.heartbeat.as_mut() {
            Some(heartbeat) => {
                heartbeat.interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Send `WATCHDOG=1`.
    pub fn beat(&mut self, notifier: &dyn InitNotifier) {
        let Some(heartbeat) = self.heartbeat.as_mut() else {
            return;
        };
        if heartbeat.schedule.liveness() == Liveness::Overdue {
            warn!(
                deadline = %format_interval(heartbeat.schedule.deadline()),
                "broker task stalled past the watchdog deadline"
            );
        }
        match notifier.notify(&NotifyState::Watchdog) {
            Ok(()) => heartbeat.schedule.record_beat(),
            Err(e) => warn!(error = %e, "watchdog heartbeat failed"),
        }
    }

    /// Stop the heartbeat for good.
    pub fn cancel(&mut self) {
        if self.heartbeat.take().is_some() {
            debug!("watchdog heartbeat cancelled");
        }
    }
}

//! `capd-runtime` – The Broker Task
//!
//! Everything that runs once the registry is built: the single serialising
//! task that owns all lease state, and the feeds that drive it.
//!
//! # Modules
//!
//! - [`broker_loop`] – [`BrokerLoop`][broker_loop::BrokerLoop]: the actor.
//!   Owns the [`Registry`][capd_kernel::Registry], the
//!   [`ShutdownCoordinator`][capd_kernel::ShutdownCoordinator], the crash
//!   reclaimer and the watchdog timer, and turns every lease transition into
//!   endpoint and signal effects through an
//!   [`EndpointHost`][capd_middleware::EndpointHost].
//! - [`reclaimer`] – [`CrashReclaimer`][reclaimer::CrashReclaimer]: drops
//!   the leases of clients whose connection went away.
//! - [`liveness`] – [`LivenessSupervisor`][liveness::LivenessSupervisor]:
//!   queries the watchdog deadline and sends `WATCHDOG=1` at half of it.
//! - [`signals`] – [`SignalBridge`][signals::SignalBridge]: turns SIGTERM,
//!   SIGINT and SIGBUS into queued broker commands.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.
//!
//! # Ordering
//!
//! Bus calls, client disconnects and signals share one command queue and
//! are handled on the broker task one at a time, in queue order.  zbus
//! dispatches each method call on its own task, so a call can reach the
//! queue after its sender's disconnect; the registry refuses requests from
//! names it has already reclaimed.  Watchdog ticks are interleaved between
//! commands.  Nothing else ever touches the registry.

pub mod broker_loop;
pub mod liveness;
pub mod reclaimer;
pub mod signals;
pub mod telemetry;

pub use broker_loop::{BrokerLoop, kill_self};
pub use liveness::LivenessSupervisor;
pub use reclaimer::CrashReclaimer;
pub use signals::SignalBridge;
pub use telemetry::{TracerProviderGuard, init_tracing};

//! `capd-kernel` – Lease Arbitration
//!
//! The part of the broker with real invariants. Nothing in here touches the
//! bus or the init system; every type is plain synchronous state owned by a
//! single caller.
//!
//! # Modules
//!
//! - [`lease`] – [`LeaseSet`][lease::LeaseSet]: the per-capability
//!   INACTIVE/ACTIVE state machine over an ordered multiset of leaseholders.
//! - [`module`] – [`CapabilityModule`][module::CapabilityModule]: the contract
//!   every device capability implements, plus the built-in modules.
//! - [`permission`] – [`PermissionPolicy`][permission::PermissionPolicy]:
//!   binary allow/deny per client and capability.
//! - [`registry`] – [`Registry`][registry::Registry]: capability → endpoint,
//!   module and leases.  The only place that toggles module activation.
//! - [`shutdown`] – [`ShutdownCoordinator`][shutdown::ShutdownCoordinator]:
//!   RUNNING → STOPPING → TERMINATED, entered once.
//! - [`watchdog`] – [`HeartbeatSchedule`][watchdog::HeartbeatSchedule]:
//!   derives the heartbeat period from the init system's deadline and tracks
//!   whether the broker is keeping up with it.

pub mod lease;
pub mod module;
pub mod permission;
pub mod registry;
pub mod shutdown;
pub mod watchdog;

pub use lease::{LeaseChange, LeaseSet, LeaseState};
pub use module::{CapabilityModule, InertModule, ModuleError, SystemModule};
pub use permission::{AllowAll, PermissionPolicy, PermissionTable};
pub use registry::{CapabilityEntry, Grant, Registry, RegistryBuilder, Transition};
pub use shutdown::{ShutdownAction, ShutdownCoordinator, ShutdownOrigin, ShutdownPhase};
pub use watchdog::{HeartbeatSchedule, Liveness, format_interval};

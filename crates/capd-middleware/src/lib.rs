//! `capd-middleware` – Everything Between the Broker and the Outside World
//!
//! The broker core never speaks D-Bus or sd_notify directly.  It sends and
//! receives through the seams defined here.
//!
//! # Modules
//!
//! - [`bus`] – Topic-based internal event bus built on Tokio broadcast
//!   channels, for in-process collaborators that care about lifecycle events.
//! - [`command`] – [`BrokerCommand`] and [`BrokerHandle`]: the inbound queue
//!   of the single serialising broker task.
//! - [`adapter`] – [`EndpointHost`]: the trait the broker uses to publish
//!   endpoints and emit bus signals.
//! - [`dbus_adapter`] – the zbus implementation of [`EndpointHost`], the
//!   broker's own D-Bus interface and the `NameOwnerChanged` feed.
//! - [`notify`] – [`InitNotifier`]: sd_notify status, readiness and watchdog.

pub mod adapter;
pub mod bus;
pub mod command;
pub mod dbus_adapter;
pub mod notify;

pub use adapter::EndpointHost;
pub use bus::{EventBus, Topic, TopicReceiver};
pub use command::{BrokerCommand, BrokerHandle, OwnershipChange};
pub use dbus_adapter::{BusKind, DbusConfig, DbusEndpointHost};
pub use notify::{InitNotifier, NotifyState, SystemdNotifier};

//! The Endpoint Host Pattern.
//!
//! The broker never talks to D-Bus itself.  When a lease transition happens
//! it asks an [`EndpointHost`] to make the capability reachable (or not) and
//! to tell clients about it.
//!
//! # Overview
//!
//! - [`EndpointHost`] – the trait every transport must implement.
//! - [`DbusEndpointHost`][crate::dbus_adapter::DbusEndpointHost] – serves
//!   endpoints on the system or session bus through zbus.

use async_trait::async_trait;
use capd_types::{BrokerError, BrokerEvent, CapabilityKind, EndpointPath};

/// Everything the broker needs from its IPC transport.
///
/// # Contract
///
/// * `publish` – make `path` reachable for `capability`.  Publishing an
///   already published path is not an error.
/// * `unpublish` – remove `path`.  Removing an absent path is not an error.
/// * `emit` – broadcast a lifecycle event to clients.  Events with no client
///   visible form (e.g. `ClientVanished`) are ignored.
/// * `release_name` – give up the broker's well-known bus name.
#[async_trait]
pub trait EndpointHost: Send + Sync {
    async fn publish(&self, capability: CapabilityKind, path: &EndpointPath) -> Result<(), BrokerError>;

    async fn unpublish(&self, path: &EndpointPath) -> Result<(), BrokerError>;

    async fn emit(&self, event: &BrokerEvent) -> Result<(), BrokerError>;

    async fn release_name(&self) -> Result<(), BrokerError>;
}

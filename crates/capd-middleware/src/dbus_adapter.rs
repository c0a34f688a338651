//! D-Bus transport for the broker, built on zbus.
//!
//! Three pieces live here:
//!
//! 1. [`BrokerInterface`] – the broker's own object.  Every method only
//!    forwards a [`BrokerCommand`][crate::command::BrokerCommand] through a
//!    [`BrokerHandle`] and awaits the answer, so no lease state is ever
//!    touched from a zbus dispatch task.
//! 2. [`DbusEndpointHost`] – the [`EndpointHost`] that publishes one
//!    [`CapabilityEndpoint`] object per active capability and emits the
//!    lifecycle signals.
//! 3. [`watch_ownership`] – turns the bus daemon's `NameOwnerChanged` signal
//!    into [`BrokerCommand::ClientVanished`][crate::command::BrokerCommand::ClientVanished]
//!    commands on the same queue as the method calls.
//!
//! # Wire contract
//!
//! | Member | Signature | Notes |
//! |---|---|---|
//! | `requestAPI` | `s → o` | `/` when refused |
//! | `releaseAPI` | `s → ()` | |
//! | `listActive` | `() → a{so}` | |
//! | `exit` | `i → ()` | always `AccessDenied` |
//! | `apiAvailable` | signal `o` | |
//! | `apiUnavailable` | signal `o` | |
//! | `aboutToQuit` | signal `()` | |

use std::collections::HashMap;

use async_trait::async_trait;
use capd_types::{BrokerError, BrokerEvent, CapabilityKind, ClientId, EndpointPath};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use zbus::message::Header;
use zbus::names::UniqueName;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{ObjectPath, Optional, OwnedObjectPath};
use zbus::{Connection, connection, fdo, interface};

use crate::adapter::EndpointHost;
use crate::command::{BrokerHandle, OwnershipChange};

/// Object path returned by `requestAPI` when the request is refused.
pub const NO_ENDPOINT: &str = "/";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which message bus to serve on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

/// Where the broker lives on the bus.
#[derive(Debug, Clone)]
pub struct DbusConfig {
    pub bus: BusKind,
    /// Well-known name to claim, e.g. `org.capd.Broker1`.
    pub service_name: String,
    /// Path of the broker object; capability endpoints hang below it.
    pub object_root: String,
}

fn bus_err(e: zbus::Error) -> BrokerError {
    BrokerError::Bus(e.to_string())
}

/// Connect to the configured bus, claim the service name and serve the
/// broker object.
///
/// # Errors
///
/// Returns [`BrokerError::Bus`] when the bus is unreachable, the name is
/// already owned or the object cannot be served.  All of these are fatal at
/// startup.
pub async fn connect(config: &DbusConfig, handle: BrokerHandle) -> Result<Connection, BrokerError> {
    let builder = match config.bus {
        BusKind::System => connection::Builder::system(),
        BusKind::Session => connection::Builder::session(),
    }
    .map_err(bus_err)?;

    let conn = builder
        .name(config.service_name.as_str())
        .map_err(bus_err)?
        .serve_at(config.object_root.as_str(), BrokerInterface::new(handle))
        .map_err(bus_err)?
        .build()
        .await
        .map_err(bus_err)?;

    info!(
        bus = ?config.bus,
        service = %config.service_name,
        path = %config.object_root,
        "broker registered on bus"
    );
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Broker object
// ---------------------------------------------------------------------------

/// The broker's own D-Bus object.
pub struct BrokerInterface {
    handle: BrokerHandle,
}

impl BrokerInterface {
    pub fn new(handle: BrokerHandle) -> Self {
        Self { handle }
    }
}

fn caller(header: &Header<'_>) -> fdo::Result<ClientId> {
    header
        .sender()
        .map(|sender| ClientId::new(sender.as_str()))
        .ok_or_else(|| fdo::Error::Failed("message carries no sender".to_string()))
}

fn to_fdo(e: BrokerError) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.capd.Broker1")]
impl BrokerInterface {
    #[zbus(name = "requestAPI")]
    async fn request_api(
        &self,
        name: String,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<OwnedObjectPath> {
        let client = caller(&header)?;
        let path = self.handle.request_api(name, client).await.map_err(to_fdo)?;
        let raw = path.as_ref().map(EndpointPath::as_str).unwrap_or(NO_ENDPOINT);
        OwnedObjectPath::try_from(raw).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    #[zbus(name = "releaseAPI")]
    async fn release_api(&self, name: String, #[zbus(header)] header: Header<'_>) -> fdo::Result<()> {
        let client = caller(&header)?;
        self.handle.release_api(name, client).await.map_err(to_fdo)
    }

    #[zbus(name = "listActive")]
    async fn list_active(&self) -> fdo::Result<HashMap<String, OwnedObjectPath>> {
        let active = self.handle.list_active().await.map_err(to_fdo)?;
        active
            .into_iter()
            .map(|(name, path)| {
                OwnedObjectPath::try_from(path.as_str())
                    .map(|p| (name, p))
                    .map_err(|e| fdo::Error::Failed(e.to_string()))
            })
            .collect()
    }

    /// Clients may not stop the shared broker.  The request is still queued
    /// so the refusal is logged in order with everything else.
    #[zbus(name = "exit")]
    async fn exit(&self, exit_code: i32, #[zbus(header)] header: Header<'_>) -> fdo::Result<()> {
        let client = caller(&header)?;
        self.handle.request_exit(client, exit_code).await.map_err(to_fdo)?;
        Err(fdo::Error::AccessDenied(
            "the broker only stops on a local signal".to_string(),
        ))
    }

    #[zbus(signal, name = "apiAvailable")]
    async fn api_available(emitter: &SignalEmitter<'_>, api: ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(signal, name = "apiUnavailable")]
    async fn api_unavailable(emitter: &SignalEmitter<'_>, api: ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(signal, name = "aboutToQuit")]
    async fn about_to_quit(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;
}

// ---------------------------------------------------------------------------
// Capability endpoints
// ---------------------------------------------------------------------------

/// The object published at a capability's endpoint while it is active.
/// Module specific interfaces are served by the modules themselves.
pub struct CapabilityEndpoint {
    capability: CapabilityKind,
}

impl CapabilityEndpoint {
    pub fn new(capability: CapabilityKind) -> Self {
        Self { capability }
    }
}

#[interface(name = "org.capd.Capability1")]
impl CapabilityEndpoint {
    #[zbus(property)]
    fn name(&self) -> String {
        self.capability.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// EndpointHost
// ---------------------------------------------------------------------------

/// [`EndpointHost`] backed by a live zbus [`Connection`].
#[derive(Clone)]
pub struct DbusEndpointHost {
    conn: Connection,
    service_name: String,
    object_root: String,
}

impl DbusEndpointHost {
    pub fn new(conn: Connection, config: &DbusConfig) -> Self {
        Self {
            conn,
            service_name: config.service_name.clone(),
            object_root: config.object_root.clone(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl EndpointHost for DbusEndpointHost {
    async fn publish(&self, capability: CapabilityKind, path: &EndpointPath) -> Result<(), BrokerError> {
        let added = self
            .conn
            .object_server()
            .at(path.as_str(), CapabilityEndpoint::new(capability))
            .await
            .map_err(bus_err)?;
        if !added {
            debug!(path = %path, "endpoint already published");
        }
        Ok(())
    }

    async fn unpublish(&self, path: &EndpointPath) -> Result<(), BrokerError> {
        match self
            .conn
            .object_server()
            .remove::<CapabilityEndpoint, _>(path.as_str())
            .await
        {
            Ok(_) | Err(zbus::Error::InterfaceNotFound) => Ok(()),
            Err(e) => Err(bus_err(e)),
        }
    }

    async fn emit(&self, event: &BrokerEvent) -> Result<(), BrokerError> {
        let emitter = SignalEmitter::new(&self.conn, self.object_root.as_str()).map_err(bus_err)?;
        match event {
            BrokerEvent::ApiAvailable { path, .. } => {
                let api = ObjectPath::try_from(path.as_str()).map_err(|e| BrokerError::Bus(e.to_string()))?;
                BrokerInterface::api_available(&emitter, api).await.map_err(bus_err)
            }
            BrokerEvent::ApiUnavailable { path, .. } => {
                let api = ObjectPath::try_from(path.as_str()).map_err(|e| BrokerError::Bus(e.to_string()))?;
                BrokerInterface::api_unavailable(&emitter, api).await.map_err(bus_err)
            }
            BrokerEvent::AboutToQuit => BrokerInterface::about_to_quit(&emitter).await.map_err(bus_err),
            BrokerEvent::ClientVanished(_) => Ok(()),
        }
    }

    async fn release_name(&self) -> Result<(), BrokerError> {
        self.conn
            .release_name(self.service_name.as_str())
            .await
            .map_err(bus_err)?;
        info!(service = %self.service_name, "released bus name");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NameOwnerChanged feed
// ---------------------------------------------------------------------------

fn owner(raw: &Optional<UniqueName<'_>>) -> Option<ClientId> {
    let raw: &Option<UniqueName<'_>> = raw;
    raw.as_ref().map(|name| ClientId::new(name.as_str()))
}

/// Subscribe to `NameOwnerChanged` and queue every disconnect on `handle`.
///
/// The subscription is established before this function returns, so no
/// disconnect that happens after startup can be missed.  The spawned task
/// ends when the stream closes or the broker task is gone.
pub async fn watch_ownership(conn: &Connection, handle: BrokerHandle) -> Result<JoinHandle<()>, BrokerError> {
    let proxy = fdo::DBusProxy::new(conn).await.map_err(bus_err)?;
    let signals = proxy.receive_name_owner_changed().await.map_err(bus_err)?;

    let changes = signals.filter_map(|signal| async move {
        match signal.args() {
            Ok(args) => Some(OwnershipChange {
                name: args.name().to_string(),
                old_owner: owner(args.old_owner()),
                new_owner: owner(args.new_owner()),
            }),
            Err(e) => {
                warn!(error = %e, "malformed NameOwnerChanged signal");
                None
            }
        }
    });
    Ok(tokio::spawn(async move {
        forward_disconnects(changes, &handle).await;
    }))
}

/// Why [`forward_disconnects`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEnd {
    /// The bus stopped delivering ownership changes.
    StreamClosed,
    /// The broker task dropped its command queue.
    BrokerGone,
}

/// Queue a [`BrokerCommand::ClientVanished`][crate::command::BrokerCommand::ClientVanished]
/// for every disconnect in `changes`.
pub async fn forward_disconnects(
    changes: impl Stream<Item = OwnershipChange>,
    handle: &BrokerHandle,
) -> FeedEnd {
    let mut changes = std::pin::pin!(changes);
    while let Some(change) = changes.next().await {
        let Some(client) = change.vanished() else {
            trace!(name = %change.name, "ownership change ignored");
            continue;
        };
        if handle.client_vanished(client).await.is_err() {
            debug!("broker gone, ownership feed exiting");
            return FeedEnd::BrokerGone;
        }
    }
    error!("NameOwnerChanged stream ended, leases of crashed clients will no longer be reclaimed");
    FeedEnd::StreamClosed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_kind_defaults_to_system() {
        assert_eq!(BusKind::default(), BusKind::System);
    }

    #[test]
    fn refusal_path_is_a_valid_object_path() {
        assert!(OwnedObjectPath::try_from(NO_ENDPOINT).is_ok());
    }

    #[test]
    fn capability_endpoints_are_valid_object_paths() {
        for kind in CapabilityKind::ALL {
            let path = EndpointPath::for_capability("/org/capd/Broker1", kind);
            assert!(ObjectPath::try_from(path.as_str()).is_ok(), "{path}");
        }
    }

    #[test]
    fn owner_maps_empty_to_none() {
        let none: Optional<UniqueName<'_>> = Optional::from(None);
        assert_eq!(owner(&none), None);

        let some: Optional<UniqueName<'_>> =
            Optional::from(Some(UniqueName::try_from(":1.42").unwrap()));
        assert_eq!(owner(&some), Some(ClientId::from(":1.42")));
    }

    fn change(name: &str, new_owner: Option<&str>) -> OwnershipChange {
        OwnershipChange {
            name: name.to_string(),
            old_owner: Some(ClientId::from(name)),
            new_owner: new_owner.map(ClientId::from),
        }
    }

    #[tokio::test]
    async fn only_disconnects_are_queued() {
        let (handle, mut rx) = BrokerHandle::channel(4);
        let feed = futures_util::stream::iter([
            change("org.example.Launcher", Some(":1.9")),
            change(":1.3", None),
        ]);

        assert_eq!(forward_disconnects(feed, &handle).await, FeedEnd::StreamClosed);
        assert!(matches!(
            rx.recv().await,
            Some(crate::command::BrokerCommand::ClientVanished(c)) if c == ClientId::from(":1.3")
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn feed_stops_when_broker_is_gone() {
        let (handle, rx) = BrokerHandle::channel(1);
        drop(rx);
        let feed = futures_util::stream::iter([change(":1.3", None), change(":1.4", None)]);
        assert_eq!(forward_disconnects(feed, &handle).await, FeedEnd::BrokerGone);
    }

    #[test]
    fn zbus_errors_become_bus_errors() {
        let err = bus_err(zbus::Error::InterfaceNotFound);
        assert!(matches!(err, BrokerError::Bus(_)));
    }
}

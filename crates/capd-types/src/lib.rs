use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The closed set of device capabilities the broker can hand out.
///
/// Names only exist at the bus boundary: clients ask for `"power"`, the
/// broker parses it into [`CapabilityKind::Power`] and never deals in raw
/// strings past that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// Wireless network management.
    Wifi,
    /// Generic system control (sleep, suspend, inhibitions).
    System,
    /// Battery and charger monitoring.
    Power,
    /// Display and screenshots.
    Screen,
    /// Application registry and launching.
    Apps,
    /// User-visible notifications.
    Notification,
}

impl CapabilityKind {
    /// Every capability, in registration order.
    pub const ALL: [CapabilityKind; 6] = [
        CapabilityKind::Wifi,
        CapabilityKind::System,
        CapabilityKind::Power,
        CapabilityKind::Screen,
        CapabilityKind::Apps,
        CapabilityKind::Notification,
    ];

    /// The wire name clients use in `requestAPI`.
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Wifi => "wifi",
            CapabilityKind::System => "system",
            CapabilityKind::Power => "power",
            CapabilityKind::Screen => "screen",
            CapabilityKind::Apps => "apps",
            CapabilityKind::Notification => "notification",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a name does not match any [`CapabilityKind`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown capability: {0}")]
pub struct UnknownCapability(pub String);

impl FromStr for CapabilityKind {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapabilityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// Bus-assigned identity of a connected client (its unique connection name,
/// e.g. `":1.42"`).
///
/// Only meaningful while the connection is alive; once the bus reports the
/// name as gone every lease held under it must be reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Object path at which a capability is reachable once published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointPath(String);

impl EndpointPath {
    /// Derive the endpoint for `kind` below the broker's object root.
    ///
    /// ```
    /// use capd_types::{CapabilityKind, EndpointPath};
    ///
    /// let path = EndpointPath::for_capability("/org/capd/Broker1", CapabilityKind::Power);
    /// assert_eq!(path.as_str(), "/org/capd/Broker1/power");
    /// ```
    pub fn for_capability(root: &str, kind: CapabilityKind) -> Self {
        Self(format!("{}/{}", root.trim_end_matches('/'), kind.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Envelope for everything broadcast on the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "capd-runtime::broker"
    pub source: String,
    pub payload: BrokerEvent,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: BrokerEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Lifecycle notifications produced by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerEvent {
    /// A capability got its first lease and its endpoint is now reachable.
    ApiAvailable {
        capability: CapabilityKind,
        path: EndpointPath,
    },
    /// A capability lost its last lease (or the broker is stopping).
    ApiUnavailable {
        capability: CapabilityKind,
        path: EndpointPath,
    },
    /// The broker is about to tear everything down.
    AboutToQuit,
    /// A client's bus connection went away.
    ClientVanished(ClientId),
}

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerError {
    #[error("Bus Error: {0}")]
    Bus(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Module Fault on {capability}: {details}")]
    Module {
        capability: CapabilityKind,
        details: String,
    },

    #[error("Init System Notification Error: {0}")]
    Notify(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Signal Handling Error: {0}")]
    Signal(String),
}

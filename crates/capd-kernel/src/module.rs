//! [`CapabilityModule`] – the contract between the broker and a capability.
//!
//! The broker does not know what enabling "power" means.  It only promises
//! to call [`CapabilityModule::set_enabled`] on the empty/non-empty lease
//! boundaries and to tell the module about clients that vanish.  A module
//! that needs slow I/O to come up must start it asynchronously and return
//! from `set_enabled` immediately.

use std::collections::HashMap;

use capd_types::{BrokerError, CapabilityKind, ClientId};
use thiserror::Error;
use tracing::{debug, info};

/// Failure reported by a module while toggling its activation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ModuleError(pub String);

impl ModuleError {
    /// Attach the capability the failure belongs to.
    pub fn on(self, capability: CapabilityKind) -> BrokerError {
        BrokerError::Module {
            capability,
            details: self.0,
        }
    }
}

/// Every capability served by the broker implements this trait.
pub trait CapabilityModule: Send {
    /// Which capability this module implements.
    fn kind(&self) -> CapabilityKind;

    /// Activate (`true`) or deactivate (`false`) the module.
    fn set_enabled(&mut self, enabled: bool) -> Result<(), ModuleError>;

    /// Whether the module currently considers itself enabled.
    fn is_enabled(&self) -> bool;

    /// Called once after every module has been registered.
    fn startup(&mut self) {}

    /// Called once during broker shutdown, after the final disable.
    fn shutdown(&mut self) {}

    /// A client's bus connection went away; drop any state kept for it.
    fn client_vanished(&mut self, _client: &ClientId) {}
}

// ────────────────────────────────────────────────────────────────────────────
// InertModule
// ────────────────────────────────────────────────────────────────────────────

/// A module with no device behaviour of its own: it records its activation
/// state and logs transitions.  Used for capabilities whose implementation
/// lives outside the broker process.
#[derive(Debug)]
pub struct InertModule {
    kind: CapabilityKind,
    enabled: bool,
}

impl InertModule {
    pub fn new(kind: CapabilityKind) -> Self {
        Self {
            kind,
            enabled: false,
        }
    }
}

impl CapabilityModule for InertModule {
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), ModuleError> {
        debug!(capability = %self.kind, enabled, "module activation changed");
        self.enabled = enabled;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SystemModule
// ────────────────────────────────────────────────────────────────────────────

/// Generic system control.  Clients may inhibit automatic sleep; the
/// inhibitions belong to the client's connection and disappear with it.
///
/// [`inhibit_sleep`][Self::inhibit_sleep] and
/// [`uninhibit_sleep`][Self::uninhibit_sleep] are driven by the module's own
/// D-Bus interface at the `system` endpoint, which is served outside the
/// broker.  The broker itself only calls
/// [`client_vanished`][CapabilityModule::client_vanished] and
/// [`shutdown`][CapabilityModule::shutdown].
#[derive(Debug, Default)]
pub struct SystemModule {
    enabled: bool,
    inhibitors: HashMap<ClientId, usize>,
}

impl SystemModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sleep inhibition held by `client`.
    pub fn inhibit_sleep(&mut self, client: &ClientId) {
        *self.inhibitors.entry(client.clone()).or_default() += 1;
    }

    /// Drop one sleep inhibition held by `client`.
    pub fn uninhibit_sleep(&mut self, client: &ClientId) {
        if let Some(count) = self.inhibitors.get_mut(client) {
            *count -= 1;
            if *count == 0 {
                self.inhibitors.remove(client);
            }
        }
    }

    /// Drop every inhibition held by `client`.
    pub fn uninhibit_all(&mut self, client: &ClientId) {
        if let Some(count) = self.inhibitors.remove(client) {
            info!(client = %client, count, "cleared sleep inhibitions");
        }
    }

    /// `true` while any client inhibits sleep.
    pub fn sleep_inhibited(&self) -> bool {
        !self.inhibitors.is_empty()
    }
}

impl CapabilityModule for SystemModule {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::System
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), ModuleError> {
        debug!(capability = %CapabilityKind::System, enabled, "module activation changed");
        self.enabled = enabled;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn shutdown(&mut self) {
        self.inhibitors.clear();
    }

    fn client_vanished(&mut self, client: &ClientId) {
        self.uninhibit_all(client);
    }
}

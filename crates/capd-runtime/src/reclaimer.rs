//! [`CrashReclaimer`] – returns the leases of clients that disappear.
//!
//! The bus daemon reports every change of name ownership.  A change whose
//! new owner is empty means a connection is gone; every lease it held must
//! be dropped exactly as if it had released them itself.
//!
//! [`watch_ownership`][capd_middleware::dbus_adapter::watch_ownership] queues
//! each disconnect as a [`BrokerCommand::ClientVanished`] on the broker's
//! command queue, behind every call the client made before it went away.
//! Calls that zbus dispatches late are refused by the registry, which
//! remembers the departed name.
//!
//! [`BrokerCommand::ClientVanished`]: capd_middleware::BrokerCommand::ClientVanished

use capd_kernel::{Registry, Transition};
use capd_types::ClientId;
use tracing::info;

#[derive(Debug, Default)]
pub struct CrashReclaimer {
    reclaimed: u64,
}

impl CrashReclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every lease `client` holds.  Returns the deactivations caused.
    pub fn reclaim(&mut self, registry: &mut Registry, client: &ClientId) -> Vec<Transition> {
        let transitions = registry.reclaim(client);
        self.reclaimed += 1;
        info!(
            client = %client,
            deactivated = transitions.len(),
            total = self.reclaimed,
            "client vanished, leases reclaimed"
        );
        transitions
    }

    /// Number of vanished clients handled so far.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed
    }
}

//! [`PermissionPolicy`] – who may lease which capability.
//!
//! The policy is consulted on every `requestAPI` and never cached.  A denial
//! is not an error: the caller simply gets the same empty answer it would
//! get for a capability that does not exist.

use std::collections::{HashMap, HashSet};

use capd_types::{CapabilityKind, ClientId};

/// Binary allow/deny decision per client and capability.
pub trait PermissionPolicy: Send {
    fn permits(&self, client: &ClientId, capability: CapabilityKind) -> bool;
}

/// Grants every capability to every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionPolicy for AllowAll {
    fn permits(&self, _client: &ClientId, _capability: CapabilityKind) -> bool {
        true
    }
}

/// A default grant set shared by all clients plus per-client extras.
///
/// # Example
///
/// ```
/// use capd_kernel::permission::{PermissionPolicy, PermissionTable};
/// use capd_types::{CapabilityKind, ClientId};
///
/// let mut table = PermissionTable::with_defaults([CapabilityKind::Power]);
/// let launcher = ClientId::from(":1.3");
/// table.grant(&launcher, CapabilityKind::Apps);
///
/// assert!(table.permits(&launcher, CapabilityKind::Power));
/// assert!(table.permits(&launcher, CapabilityKind::Apps));
/// assert!(!table.permits(&ClientId::from(":1.4"), CapabilityKind::Apps));
/// ```
#[derive(Debug, Default, Clone)]
pub struct PermissionTable {
    defaults: HashSet<CapabilityKind>,
    grants: HashMap<ClientId, HashSet<CapabilityKind>>,
}

impl PermissionTable {
    /// Create an empty table that denies everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table granting `defaults` to every client.
    pub fn with_defaults(defaults: impl IntoIterator<Item = CapabilityKind>) -> Self {
        Self {
            defaults: defaults.into_iter().collect(),
            grants: HashMap::new(),
        }
    }

    /// Grant `capability` to `client`.  Duplicate grants are silently ignored.
    pub fn grant(&mut self, client: &ClientId, capability: CapabilityKind) {
        self.grants
            .entry(client.clone())
            .or_default()
            .insert(capability);
    }

    /// Revoke a per-client grant.  No-ops if the client or grant is absent.
    /// Default grants are not affected.
    pub fn revoke(&mut self, client: &ClientId, capability: CapabilityKind) {
        if let Some(set) = self.grants.get_mut(client) {
            set.remove(&capability);
        }
    }
}

impl PermissionPolicy for PermissionTable {
    fn permits(&self, client: &ClientId, capability: CapabilityKind) -> bool {
        self.defaults.contains(&capability)
            || self
                .grants
                .get(client)
                .map(|s| s.contains(&capability))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> ClientId {
        ClientId::from(id)
    }

    #[test]
    fn allow_all_permits_everything() {
        for kind in CapabilityKind::ALL {
            assert!(AllowAll.permits(&client(":1.1"), kind));
        }
    }

    #[test]
    fn empty_table_denies() {
        let table = PermissionTable::new();
        assert!(!table.permits(&client(":1.1"), CapabilityKind::Power));
    }

    #[test]
    fn defaults_apply_to_unknown_clients() {
        let table = PermissionTable::with_defaults([CapabilityKind::Wifi]);
        assert!(table.permits(&client(":1.99"), CapabilityKind::Wifi));
        assert!(!table.permits(&client(":1.99"), CapabilityKind::System));
    }

    #[test]
    fn grant_is_per_client() {
        let mut table = PermissionTable::new();
        table.grant(&client(":1.1"), CapabilityKind::Screen);
        assert!(table.permits(&client(":1.1"), CapabilityKind::Screen));
        assert!(!table.permits(&client(":1.2"), CapabilityKind::Screen));
    }

    #[test]
    fn revoke_removes_grant() {
        let mut table = PermissionTable::new();
        table.grant(&client(":1.1"), CapabilityKind::Screen);
        table.revoke(&client(":1.1"), CapabilityKind::Screen);
        assert!(!table.permits(&client(":1.1"), CapabilityKind::Screen));
    }

    #[test]
    fn revoke_nonexistent_is_noop() {
        let mut table = PermissionTable::new();
        // Should not panic even when client or grant was never recorded.
        table.revoke(&client("ghost"), CapabilityKind::Apps);
    }

    #[test]
    fn revoke_does_not_touch_defaults() {
        let mut table = PermissionTable::with_defaults([CapabilityKind::Power]);
        table.grant(&client(":1.1"), CapabilityKind::Power);
        table.revoke(&client(":1.1"), CapabilityKind::Power);
        assert!(table.permits(&client(":1.1"), CapabilityKind::Power));
    }

    #[test]
    fn duplicate_grant_is_idempotent() {
        let mut table = PermissionTable::new();
        table.grant(&client(":1.1"), CapabilityKind::Apps);
        table.grant(&client(":1.1"), CapabilityKind::Apps);
        // Revoke once should still remove the grant.
        table.revoke(&client(":1.1"), CapabilityKind::Apps);
        assert!(!table.permits(&client(":1.1"), CapabilityKind::Apps));
    }
}

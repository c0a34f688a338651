//! [`Registry`] – capability → endpoint, module and leases.
//!
//! The registry is built once by the startup sequence through
//! [`RegistryBuilder`] and then handed, by value, to the single task that
//! serialises every lease mutation.  The set of capabilities is fixed from
//! that point on.
//!
//! Each lease mutation returns the [`Transition`] it caused (if any).  The
//! caller turns transitions into bus effects: publish the endpoint and emit
//! `apiAvailable` on [`Transition::Activated`], unpublish and emit
//! `apiUnavailable` on [`Transition::Deactivated`].
//!
//! # Example
//!
//! ```
//! use capd_kernel::{InertModule, Registry, Transition};
//! use capd_types::{CapabilityKind, ClientId};
//!
//! let mut registry = Registry::builder("/org/capd/Broker1")
//!     .register(Box::new(InertModule::new(CapabilityKind::Power)))
//!     .build();
//!
//! let a = ClientId::from(":1.7");
//! let grant = registry.request_api(CapabilityKind::Power, &a).unwrap();
//! assert_eq!(grant.path.as_str(), "/org/capd/Broker1/power");
//! assert!(matches!(grant.transition, Some(Transition::Activated { .. })));
//!
//! let released = registry.release_api(CapabilityKind::Power, &a);
//! assert!(matches!(released, Some(Transition::Deactivated { .. })));
//! ```

use std::collections::{BTreeMap, HashSet, VecDeque};

use capd_types::{BrokerEvent, CapabilityKind, ClientId, EndpointPath};
use tracing::{debug, error, info, warn};

use crate::lease::{LeaseChange, LeaseSet, LeaseState};
use crate::module::CapabilityModule;
use crate::permission::{AllowAll, PermissionPolicy};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// A crossing of the empty/non-empty lease boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The module was enabled; its endpoint must become reachable.
    Activated {
        capability: CapabilityKind,
        path: EndpointPath,
    },
    /// The module was disabled; its endpoint must disappear.
    Deactivated {
        capability: CapabilityKind,
        path: EndpointPath,
    },
}

impl Transition {
    pub fn capability(&self) -> CapabilityKind {
        match self {
            Transition::Activated { capability, .. } | Transition::Deactivated { capability, .. } => {
                *capability
            }
        }
    }

    pub fn path(&self) -> &EndpointPath {
        match self {
            Transition::Activated { path, .. } | Transition::Deactivated { path, .. } => path,
        }
    }

    /// The lifecycle event clients observe for this transition.
    pub fn into_event(self) -> BrokerEvent {
        match self {
            Transition::Activated { capability, path } => {
                BrokerEvent::ApiAvailable { capability, path }
            }
            Transition::Deactivated { capability, path } => {
                BrokerEvent::ApiUnavailable { capability, path }
            }
        }
    }
}

/// Successful answer to [`Registry::request_api`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Endpoint the requester should talk to.
    pub path: EndpointPath,
    /// Set when this request was the capability's first lease.
    pub transition: Option<Transition>,
}

/// One registered capability.
pub struct CapabilityEntry {
    capability: CapabilityKind,
    endpoint: EndpointPath,
    module: Box<dyn CapabilityModule>,
    leases: LeaseSet,
}

impl CapabilityEntry {
    pub fn capability(&self) -> CapabilityKind {
        self.capability
    }

    pub fn endpoint(&self) -> &EndpointPath {
        &self.endpoint
    }

    pub fn leases(&self) -> &LeaseSet {
        &self.leases
    }

    pub fn is_active(&self) -> bool {
        self.leases.state() == LeaseState::Active
    }

    /// Run the module side of a lease change.
    ///
    /// A module that fails to toggle is reported and left as is; the lease
    /// bookkeeping is not rolled back.
    fn settle(&mut self, change: LeaseChange) -> Option<Transition> {
        let enabled = match change {
            LeaseChange::Activated => true,
            LeaseChange::Deactivated => false,
            LeaseChange::Unchanged => return None,
        };
        if let Err(e) = self.module.set_enabled(enabled) {
            let e = e.on(self.capability);
            error!(enabled, error = %e, "module failed to change activation");
        }
        let capability = self.capability;
        let path = self.endpoint.clone();
        Some(if enabled {
            info!(capability = %capability, path = %path, "capability activated");
            Transition::Activated { capability, path }
        } else {
            info!(capability = %capability, path = %path, "capability deactivated");
            Transition::Deactivated { capability, path }
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Departed clients
// ────────────────────────────────────────────────────────────────────────────

/// How many vanished connections are remembered.
pub const DEPARTED_CAPACITY: usize = 4096;

/// Unique names of connections the bus reported gone, oldest first.
///
/// Unique names are never reused by the bus daemon, so a request still in
/// flight when its sender vanished can be recognised and refused.  Only the
/// most recent [`DEPARTED_CAPACITY`] names are kept.
#[derive(Debug, Default)]
struct Departed {
    order: VecDeque<ClientId>,
    names: HashSet<ClientId>,
}

impl Departed {
    fn insert(&mut self, client: &ClientId) {
        if !self.names.insert(client.clone()) {
            return;
        }
        self.order.push_back(client.clone());
        if self.order.len() > DEPARTED_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.names.remove(&oldest);
        }
    }

    fn contains(&self, client: &ClientId) -> bool {
        self.names.contains(client)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

/// Collects the modules and permission policy before the registry is sealed.
pub struct RegistryBuilder {
    object_root: String,
    entries: BTreeMap<CapabilityKind, CapabilityEntry>,
    policy: Box<dyn PermissionPolicy>,
}

impl RegistryBuilder {
    /// Start a registry whose endpoints live below `object_root`.  The
    /// default policy is [`AllowAll`].
    pub fn new(object_root: impl Into<String>) -> Self {
        Self {
            object_root: object_root.into(),
            entries: BTreeMap::new(),
            policy: Box::new(AllowAll),
        }
    }

    /// Replace the permission policy.
    pub fn policy(mut self, policy: impl PermissionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Register `module` under the capability it reports.  A second module
    /// for the same capability replaces the first.
    pub fn register(mut self, module: Box<dyn CapabilityModule>) -> Self {
        let capability = module.kind();
        let entry = CapabilityEntry {
            capability,
            endpoint: EndpointPath::for_capability(&self.object_root, capability),
            module,
            leases: LeaseSet::new(),
        };
        if self.entries.insert(capability, entry).is_some() {
            warn!(capability = %capability, "capability registered twice; keeping the last module");
        }
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            entries: self.entries,
            policy: self.policy,
            departed: Departed::default(),
            stopped: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// Owner of every [`CapabilityEntry`].
pub struct Registry {
    entries: BTreeMap<CapabilityKind, CapabilityEntry>,
    policy: Box<dyn PermissionPolicy>,
    departed: Departed,
    stopped: bool,
}

impl Registry {
    pub fn builder(object_root: impl Into<String>) -> RegistryBuilder {
        RegistryBuilder::new(object_root)
    }

    /// Registered capabilities in key order.
    pub fn capabilities(&self) -> impl Iterator<Item = CapabilityKind> + '_ {
        self.entries.keys().copied()
    }

    pub fn entry(&self, capability: CapabilityKind) -> Option<&CapabilityEntry> {
        self.entries.get(&capability)
    }

    /// Direct access to a module for trusted in-process callers.  Bypasses
    /// the lease protocol entirely.
    pub fn get(&self, capability: CapabilityKind) -> Option<&dyn CapabilityModule> {
        self.entries.get(&capability).map(|e| e.module.as_ref())
    }

    /// Take a lease on `capability` for `requester`.
    ///
    /// Returns `None` when the capability is not registered, the policy
    /// denies it, the requester has already vanished from the bus, or the
    /// registry has been shut down.  The caller cannot tell these apart.
    pub fn request_api(&mut self, capability: CapabilityKind, requester: &ClientId) -> Option<Grant> {
        if self.stopped {
            debug!(capability = %capability, client = %requester, "request after shutdown ignored");
            return None;
        }
        if self.departed.contains(requester) {
            debug!(capability = %capability, client = %requester, "request from vanished client ignored");
            return None;
        }
        if !self.policy.permits(requester, capability) {
            debug!(capability = %capability, client = %requester, "request denied by policy");
            return None;
        }
        let entry = self.entries.get_mut(&capability)?;
        let change = entry.leases.acquire(requester.clone());
        let transition = entry.settle(change);
        debug!(
            capability = %capability,
            client = %requester,
            leases = entry.leases.count(),
            "lease acquired"
        );
        Some(Grant {
            path: entry.endpoint.clone(),
            transition,
        })
    }

    /// Give back one lease on `capability`.  Unknown capabilities and
    /// releases beyond the held count are no-ops.
    pub fn release_api(&mut self, capability: CapabilityKind, requester: &ClientId) -> Option<Transition> {
        let entry = self.entries.get_mut(&capability)?;
        if entry.leases.count_for(requester) == 0 {
            return None;
        }
        let change = entry.leases.release(requester);
        debug!(
            capability = %capability,
            client = %requester,
            leases = entry.leases.count(),
            "lease released"
        );
        entry.settle(change)
    }

    /// Drop every lease `client` holds, on every capability, exactly as if
    /// it had released them itself, then let modules forget the client.
    /// Later requests under the same name are refused.
    pub fn reclaim(&mut self, client: &ClientId) -> Vec<Transition> {
        self.departed.insert(client);
        let mut transitions = Vec::new();
        for entry in self.entries.values_mut() {
            let held = entry.leases.count_for(client);
            if held > 0 {
                debug!(capability = %entry.capability, client = %client, held, "reclaiming leases");
            }
            let change = entry.leases.release_all(client);
            transitions.extend(entry.settle(change));
            entry.module.client_vanished(client);
        }
        transitions
    }

    /// Capabilities with at least one lease, with their endpoints.
    pub fn list_active(&self) -> BTreeMap<CapabilityKind, EndpointPath> {
        self.entries
            .values()
            .filter(|e| e.is_active())
            .map(|e| (e.capability, e.endpoint.clone()))
            .collect()
    }

    /// Run every module's startup hook.
    pub fn startup(&mut self) {
        for entry in self.entries.values_mut() {
            entry.module.startup();
        }
    }

    /// Disable every module regardless of its leases and run its shutdown
    /// hook.  Returns one [`Transition::Deactivated`] per capability so the
    /// caller can unpublish every endpoint.  Only the first call does any
    /// work.
    pub fn shutdown(&mut self) -> Vec<Transition> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;
        let mut transitions = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values_mut() {
            let dropped = entry.leases.clear();
            if let Err(e) = entry.module.set_enabled(false) {
                let e = e.on(entry.capability);
                error!(error = %e, "module failed to disable during shutdown");
            }
            entry.module.shutdown();
            debug!(capability = %entry.capability, dropped, "capability shut down");
            transitions.push(Transition::Deactivated {
                capability: entry.capability,
                path: entry.endpoint.clone(),
            });
        }
        transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleError;
    use crate::permission::PermissionTable;
    use std::sync::{Arc, Mutex};

    const ROOT: &str = "/org/capd/Broker1";

    /// Every `set_enabled` call and vanished client, in order.
    #[derive(Default)]
    struct Journal {
        toggles: Vec<(CapabilityKind, bool)>,
        vanished: Vec<(CapabilityKind, ClientId)>,
        shutdowns: usize,
    }

    struct RecordingModule {
        kind: CapabilityKind,
        enabled: bool,
        fail: bool,
        journal: Arc<Mutex<Journal>>,
    }

    impl CapabilityModule for RecordingModule {
        fn kind(&self) -> CapabilityKind {
            self.kind
        }

        fn set_enabled(&mut self, enabled: bool) -> Result<(), ModuleError> {
            self.journal.lock().unwrap().toggles.push((self.kind, enabled));
            if self.fail {
                return Err(ModuleError("device busy".to_string()));
            }
            self.enabled = enabled;
            Ok(())
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn shutdown(&mut self) {
            self.journal.lock().unwrap().shutdowns += 1;
        }

        fn client_vanished(&mut self, client: &ClientId) {
            self.journal.lock().unwrap().vanished.push((self.kind, client.clone()));
        }
    }

    fn module(kind: CapabilityKind, journal: &Arc<Mutex<Journal>>) -> Box<dyn CapabilityModule> {
        Box::new(RecordingModule {
            kind,
            enabled: false,
            fail: false,
            journal: Arc::clone(journal),
        })
    }

    fn registry_with(kinds: &[CapabilityKind]) -> (Registry, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let mut builder = Registry::builder(ROOT);
        for kind in kinds {
            builder = builder.register(module(*kind, &journal));
        }
        (builder.build(), journal)
    }

    fn toggles(journal: &Arc<Mutex<Journal>>) -> Vec<(CapabilityKind, bool)> {
        journal.lock().unwrap().toggles.clone()
    }

    fn client(id: &str) -> ClientId {
        ClientId::from(id)
    }

    #[test]
    fn shared_capability_scenario() {
        let (mut registry, journal) = registry_with(&[CapabilityKind::Power]);
        let a = client(":1.1");
        let b = client(":1.2");

        let grant = registry.request_api(CapabilityKind::Power, &a).unwrap();
        assert_eq!(
            grant.transition,
            Some(Transition::Activated {
                capability: CapabilityKind::Power,
                path: EndpointPath::for_capability(ROOT, CapabilityKind::Power),
            })
        );

        let grant = registry.request_api(CapabilityKind::Power, &b).unwrap();
        assert_eq!(grant.transition, None);
        assert_eq!(toggles(&journal), vec![(CapabilityKind::Power, true)]);

        assert_eq!(registry.release_api(CapabilityKind::Power, &a), None);
        assert!(registry.get(CapabilityKind::Power).unwrap().is_enabled());

        let released = registry.release_api(CapabilityKind::Power, &b);
        assert!(matches!(released, Some(Transition::Deactivated { .. })));
        assert!(!registry.get(CapabilityKind::Power).unwrap().is_enabled());
        assert_eq!(
            toggles(&journal),
            vec![(CapabilityKind::Power, true), (CapabilityKind::Power, false)]
        );
    }

    #[test]
    fn n_requests_then_n_releases_round_trip() {
        let (mut registry, journal) = registry_with(&[CapabilityKind::Screen]);
        let a = client(":1.1");
        for _ in 0..4 {
            registry.request_api(CapabilityKind::Screen, &a).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(registry.release_api(CapabilityKind::Screen, &a), None);
        }
        assert!(registry.release_api(CapabilityKind::Screen, &a).is_some());
        assert!(!registry.get(CapabilityKind::Screen).unwrap().is_enabled());
        assert_eq!(toggles(&journal).len(), 2);
    }

    #[test]
    fn release_without_lease_never_disables() {
        let (mut registry, journal) = registry_with(&[CapabilityKind::Power]);
        let a = client(":1.1");
        assert_eq!(registry.release_api(CapabilityKind::Power, &a), None);

        registry.request_api(CapabilityKind::Power, &a).unwrap();
        registry.release_api(CapabilityKind::Power, &a);
        assert_eq!(registry.release_api(CapabilityKind::Power, &a), None);
        assert_eq!(registry.release_api(CapabilityKind::Power, &a), None);
        assert_eq!(
            toggles(&journal),
            vec![(CapabilityKind::Power, true), (CapabilityKind::Power, false)]
        );
    }

    #[test]
    fn release_by_stranger_keeps_capability_active() {
        let (mut registry, _journal) = registry_with(&[CapabilityKind::Power]);
        registry.request_api(CapabilityKind::Power, &client(":1.1")).unwrap();
        assert_eq!(registry.release_api(CapabilityKind::Power, &client(":1.5")), None);
        assert!(registry.entry(CapabilityKind::Power).unwrap().is_active());
    }

    #[test]
    fn unregistered_capability_is_refused_silently() {
        let (mut registry, journal) = registry_with(&[CapabilityKind::Power]);
        assert!(registry.request_api(CapabilityKind::Wifi, &client(":1.1")).is_none());
        assert_eq!(registry.release_api(CapabilityKind::Wifi, &client(":1.1")), None);
        assert!(toggles(&journal).is_empty());
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn denied_request_changes_nothing() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let mut registry = Registry::builder(ROOT)
            .policy(PermissionTable::with_defaults([CapabilityKind::Power]))
            .register(module(CapabilityKind::Power, &journal))
            .register(module(CapabilityKind::Apps, &journal))
            .build();

        assert!(registry.request_api(CapabilityKind::Apps, &client(":1.1")).is_none());
        assert!(registry.request_api(CapabilityKind::Power, &client(":1.1")).is_some());
        assert_eq!(toggles(&journal), vec![(CapabilityKind::Power, true)]);
    }

    #[test]
    fn crash_reclaims_every_lease_of_client() {
        let (mut registry, journal) = registry_with(&[
            CapabilityKind::Wifi,
            CapabilityKind::Power,
            CapabilityKind::Screen,
        ]);
        let c = client(":1.3");
        let other = client(":1.4");
        registry.request_api(CapabilityKind::Wifi, &c).unwrap();
        registry.request_api(CapabilityKind::Wifi, &c).unwrap();
        registry.request_api(CapabilityKind::Power, &c).unwrap();
        registry.request_api(CapabilityKind::Screen, &c).unwrap();
        registry.request_api(CapabilityKind::Screen, &other).unwrap();

        let transitions = registry.reclaim(&c);
        let deactivated: Vec<_> = transitions.iter().map(Transition::capability).collect();
        assert_eq!(deactivated, vec![CapabilityKind::Wifi, CapabilityKind::Power]);

        assert!(!registry.get(CapabilityKind::Wifi).unwrap().is_enabled());
        assert!(!registry.get(CapabilityKind::Power).unwrap().is_enabled());
        assert!(registry.get(CapabilityKind::Screen).unwrap().is_enabled());
        assert_eq!(registry.entry(CapabilityKind::Screen).unwrap().leases().holders(), &[other]);

        let disables = toggles(&journal).iter().filter(|(_, on)| !on).count();
        assert_eq!(disables, 2);
    }

    #[test]
    fn reclaim_forwards_vanished_client_to_every_module() {
        let (mut registry, journal) = registry_with(&[CapabilityKind::System, CapabilityKind::Apps]);
        let c = client(":1.3");
        assert!(registry.reclaim(&c).is_empty());
        let vanished = journal.lock().unwrap().vanished.clone();
        assert_eq!(
            vanished,
            vec![(CapabilityKind::System, c.clone()), (CapabilityKind::Apps, c)]
        );
    }

    #[test]
    fn vanished_client_cannot_lease_again() {
        let (mut registry, journal) = registry_with(&[CapabilityKind::Wifi]);
        let c = client(":1.3");
        assert!(registry.reclaim(&c).is_empty());

        assert!(registry.request_api(CapabilityKind::Wifi, &c).is_none());
        assert!(registry.list_active().is_empty());
        assert!(toggles(&journal).is_empty());

        assert!(registry.request_api(CapabilityKind::Wifi, &client(":1.4")).is_some());
    }

    #[test]
    fn departed_names_are_bounded() {
        let mut departed = Departed::default();
        for n in 0..=DEPARTED_CAPACITY {
            departed.insert(&client(&format!(":1.{n}")));
        }
        departed.insert(&client(":1.1"));
        assert_eq!(departed.order.len(), DEPARTED_CAPACITY);
        assert!(!departed.contains(&client(":1.0")));
        assert!(departed.contains(&client(&format!(":1.{DEPARTED_CAPACITY}"))));
    }

    #[test]
    fn list_active_tracks_leases_exactly() {
        let (mut registry, _journal) = registry_with(&[CapabilityKind::Power, CapabilityKind::Wifi]);
        let a = client(":1.1");
        assert!(registry.list_active().is_empty());

        registry.request_api(CapabilityKind::Wifi, &a).unwrap();
        let active = registry.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(
            active.get(&CapabilityKind::Wifi),
            Some(&EndpointPath::for_capability(ROOT, CapabilityKind::Wifi))
        );

        registry.release_api(CapabilityKind::Wifi, &a);
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn failing_module_stays_nominally_active() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let mut registry = Registry::builder(ROOT)
            .register(Box::new(RecordingModule {
                kind: CapabilityKind::Wifi,
                enabled: false,
                fail: true,
                journal: Arc::clone(&journal),
            }))
            .build();

        let grant = registry.request_api(CapabilityKind::Wifi, &client(":1.1")).unwrap();
        assert!(matches!(grant.transition, Some(Transition::Activated { .. })));
        assert!(registry.entry(CapabilityKind::Wifi).unwrap().is_active());
        assert!(!registry.get(CapabilityKind::Wifi).unwrap().is_enabled());
    }

    #[test]
    fn shutdown_disables_every_module_exactly_once() {
        let (mut registry, journal) = registry_with(&[
            CapabilityKind::Power,
            CapabilityKind::Wifi,
            CapabilityKind::Apps,
        ]);
        registry.request_api(CapabilityKind::Power, &client(":1.1")).unwrap();

        let transitions = registry.shutdown();
        assert_eq!(transitions.len(), 3);
        assert!(transitions.iter().all(|t| matches!(t, Transition::Deactivated { .. })));
        assert!(registry.shutdown().is_empty());

        let disables: Vec<_> = toggles(&journal).into_iter().filter(|(_, on)| !on).collect();
        assert_eq!(disables.len(), 3);
        assert_eq!(journal.lock().unwrap().shutdowns, 3);
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn requests_after_shutdown_are_refused() {
        let (mut registry, _journal) = registry_with(&[CapabilityKind::Power]);
        registry.shutdown();
        assert!(registry.request_api(CapabilityKind::Power, &client(":1.1")).is_none());
    }

    #[test]
    fn transition_maps_to_lifecycle_event() {
        let path = EndpointPath::for_capability(ROOT, CapabilityKind::Apps);
        let event = Transition::Deactivated {
            capability: CapabilityKind::Apps,
            path: path.clone(),
        }
        .into_event();
        assert_eq!(
            event,
            BrokerEvent::ApiUnavailable {
                capability: CapabilityKind::Apps,
                path
            }
        );
    }

    #[test]
    fn capabilities_iterate_in_key_order() {
        let (registry, _journal) = registry_with(&[CapabilityKind::Notification, CapabilityKind::Wifi]);
        let kinds: Vec<_> = registry.capabilities().collect();
        assert_eq!(kinds, vec![CapabilityKind::Wifi, CapabilityKind::Notification]);
    }
}

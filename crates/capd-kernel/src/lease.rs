//! [`LeaseSet`] – per-capability lease bookkeeping.
//!
//! A capability is ACTIVE while at least one lease is outstanding.  The same
//! client may hold several leases on one capability and has to release each
//! of them before the count drops to zero.
//!
//! Every mutation reports a [`LeaseChange`] so the caller knows whether the
//! empty/non-empty boundary was crossed.  Those crossings are the only points
//! at which a module may be enabled or disabled.
//!
//! # Example
//!
//! ```
//! use capd_kernel::lease::{LeaseChange, LeaseSet};
//! use capd_types::ClientId;
//!
//! let mut leases = LeaseSet::new();
//! let a = ClientId::from(":1.7");
//!
//! assert_eq!(leases.acquire(a.clone()), LeaseChange::Activated);
//! assert_eq!(leases.acquire(a.clone()), LeaseChange::Unchanged);
//! assert_eq!(leases.release(&a), LeaseChange::Unchanged);
//! assert_eq!(leases.release(&a), LeaseChange::Deactivated);
//! assert_eq!(leases.release(&a), LeaseChange::Unchanged);
//! ```

use capd_types::ClientId;

/// Activation state derived from the lease count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// No leases; module disabled, endpoint unpublished.
    Inactive,
    /// At least one lease; module enabled, endpoint published.
    Active,
}

/// Outcome of a single lease mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseChange {
    /// INACTIVE → ACTIVE.
    Activated,
    /// ACTIVE → INACTIVE.
    Deactivated,
    /// The state did not change.
    Unchanged,
}

/// Ordered multiset of leaseholders for one capability.
#[derive(Debug, Default, Clone)]
pub struct LeaseSet {
    holders: Vec<ClientId>,
}

impl LeaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LeaseState {
        if self.holders.is_empty() {
            LeaseState::Inactive
        } else {
            LeaseState::Active
        }
    }

    /// Total number of outstanding leases.
    pub fn count(&self) -> usize {
        self.holders.len()
    }

    /// Number of leases held by `client`.
    pub fn count_for(&self, client: &ClientId) -> usize {
        self.holders.iter().filter(|h| *h == client).count()
    }

    /// Leaseholders in acquisition order, duplicates included.
    pub fn holders(&self) -> &[ClientId] {
        &self.holders
    }

    /// Append a lease for `client`.
    pub fn acquire(&mut self, client: ClientId) -> LeaseChange {
        let was = self.state();
        self.holders.push(client);
        Self::change(was, self.state())
    }

    /// Drop one lease held by `client`.  Releasing a lease the client does
    /// not hold is a no-op.
    pub fn release(&mut self, client: &ClientId) -> LeaseChange {
        let was = self.state();
        if let Some(pos) = self.holders.iter().position(|h| h == client) {
            self.holders.remove(pos);
        }
        Self::change(was, self.state())
    }

    /// Drop every lease held by `client`.
    pub fn release_all(&mut self, client: &ClientId) -> LeaseChange {
        let was = self.state();
        self.holders.retain(|h| h != client);
        Self::change(was, self.state())
    }

    /// Forget every lease.  Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.holders.len();
        self.holders.clear();
        dropped
    }

    fn change(was: LeaseState, now: LeaseState) -> LeaseChange {
        match (was, now) {
            (LeaseState::Inactive, LeaseState::Active) => LeaseChange::Activated,
            (LeaseState::Active, LeaseState::Inactive) => LeaseChange::Deactivated,
            _ => LeaseChange::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> ClientId {
        ClientId::from(id)
    }

    #[test]
    fn fresh_set_is_inactive() {
        let leases = LeaseSet::new();
        assert_eq!(leases.state(), LeaseState::Inactive);
        assert_eq!(leases.count(), 0);
    }

    #[test]
    fn first_acquire_activates() {
        let mut leases = LeaseSet::new();
        assert_eq!(leases.acquire(client(":1.1")), LeaseChange::Activated);
        assert_eq!(leases.state(), LeaseState::Active);
    }

    #[test]
    fn second_client_does_not_reactivate() {
        let mut leases = LeaseSet::new();
        leases.acquire(client(":1.1"));
        assert_eq!(leases.acquire(client(":1.2")), LeaseChange::Unchanged);
        assert_eq!(leases.count(), 2);
    }

    #[test]
    fn n_requests_need_n_releases() {
        let mut leases = LeaseSet::new();
        let a = client(":1.1");
        for _ in 0..3 {
            leases.acquire(a.clone());
        }
        assert_eq!(leases.count_for(&a), 3);
        assert_eq!(leases.release(&a), LeaseChange::Unchanged);
        assert_eq!(leases.release(&a), LeaseChange::Unchanged);
        assert_eq!(leases.release(&a), LeaseChange::Deactivated);
        assert_eq!(leases.state(), LeaseState::Inactive);
    }

    #[test]
    fn release_beyond_count_is_noop() {
        let mut leases = LeaseSet::new();
        let a = client(":1.1");
        leases.acquire(a.clone());
        assert_eq!(leases.release(&a), LeaseChange::Deactivated);
        assert_eq!(leases.release(&a), LeaseChange::Unchanged);
        assert_eq!(leases.release(&a), LeaseChange::Unchanged);
    }

    #[test]
    fn release_by_non_holder_keeps_other_leases() {
        let mut leases = LeaseSet::new();
        leases.acquire(client(":1.1"));
        assert_eq!(leases.release(&client(":1.9")), LeaseChange::Unchanged);
        assert_eq!(leases.count(), 1);
    }

    #[test]
    fn release_removes_only_one_occurrence() {
        let mut leases = LeaseSet::new();
        let a = client(":1.1");
        let b = client(":1.2");
        leases.acquire(a.clone());
        leases.acquire(b.clone());
        leases.acquire(a.clone());
        leases.release(&a);
        assert_eq!(leases.holders(), &[b, a]);
    }

    #[test]
    fn release_all_drops_every_lease_of_client() {
        let mut leases = LeaseSet::new();
        let a = client(":1.1");
        leases.acquire(a.clone());
        leases.acquire(a.clone());
        assert_eq!(leases.release_all(&a), LeaseChange::Deactivated);
        assert_eq!(leases.count(), 0);
    }

    #[test]
    fn release_all_with_other_holders_stays_active() {
        let mut leases = LeaseSet::new();
        let a = client(":1.1");
        leases.acquire(a.clone());
        leases.acquire(client(":1.2"));
        assert_eq!(leases.release_all(&a), LeaseChange::Unchanged);
        assert_eq!(leases.state(), LeaseState::Active);
    }

    #[test]
    fn release_all_on_empty_set_is_noop() {
        let mut leases = LeaseSet::new();
        assert_eq!(leases.release_all(&client(":1.1")), LeaseChange::Unchanged);
    }

    #[test]
    fn clear_reports_dropped_count() {
        let mut leases = LeaseSet::new();
        leases.acquire(client(":1.1"));
        leases.acquire(client(":1.2"));
        assert_eq!(leases.clear(), 2);
        assert_eq!(leases.state(), LeaseState::Inactive);
    }
}

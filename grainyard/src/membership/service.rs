//! Membership service: the runtime's view of cluster topology.
//!
//! The [`MembershipService`] trait gives every component the same three
//! primitives — current snapshot, subscribe to updates, refresh at least to
//! a version — so implementations can range from a shared in-memory table
//! (tests, single-process clusters) to a replicated store behind the
//! `membership` configuration option.
//!
//! Components must not cache a snapshot across an async suspension; re-read
//! through the service after every await.

use crate::error::MembershipError;
use crate::membership::{ClusterMembershipSnapshot, MembershipVersion, SiloStatus};
use grainyard_core::SiloAddress;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tokio::sync::watch;

/// Read and mutate the versioned membership view.
///
/// Ordering contract: versions strictly increase; an observer that has seen
/// version `v` is never later handed a snapshot `< v`. Delivery across
/// subscribers is not synchronized — each component tolerates arbitrary
/// interleaving with its own work.
#[async_trait::async_trait(?Send)]
pub trait MembershipService: fmt::Debug {
    /// The latest snapshot.
    fn current(&self) -> ClusterMembershipSnapshot;

    /// Subscribe to snapshot updates.
    ///
    /// The receiver is primed with the current snapshot; every table write
    /// publishes a fresh one.
    fn subscribe(&self) -> watch::Receiver<ClusterMembershipSnapshot>;

    /// Wait until the published version is at least `version`, returning
    /// the snapshot that satisfied the bound.
    async fn refresh_at_least(
        &self,
        version: MembershipVersion,
    ) -> Result<ClusterMembershipSnapshot, MembershipError>;

    /// Register a silo (or supersede its previous incarnation).
    async fn register_silo(
        &self,
        silo: SiloAddress,
        status: SiloStatus,
    ) -> Result<MembershipVersion, MembershipError>;

    /// Transition a registered silo to a new status.
    async fn update_status(
        &self,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<MembershipVersion, MembershipError>;
}

/// Shared in-memory membership table.
///
/// All silos in one process share the same `Rc<SharedMembership>`, giving a
/// consistent view with no replication delay — the simulation and test
/// provider. A restarted silo registering at the same endpoint with a
/// higher generation marks the older incarnation Dead.
pub struct SharedMembership {
    table: RefCell<ClusterMembershipSnapshot>,
    publisher: watch::Sender<ClusterMembershipSnapshot>,
}

impl fmt::Debug for SharedMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.borrow();
        f.debug_struct("SharedMembership")
            .field("version", &table.version)
            .field("members", &table.members.len())
            .finish()
    }
}

impl SharedMembership {
    /// Create an empty shared membership table.
    pub fn new() -> Rc<Self> {
        let (publisher, _) = watch::channel(ClusterMembershipSnapshot::new());
        Rc::new(Self {
            table: RefCell::new(ClusterMembershipSnapshot::new()),
            publisher,
        })
    }

    /// Create a table pre-populated with Active silos (test convenience).
    pub fn with_active(silos: Vec<SiloAddress>) -> Rc<Self> {
        let shared = Self::new();
        {
            let mut table = shared.table.borrow_mut();
            for silo in silos {
                table.members.insert(silo, SiloStatus::Active);
                table.version = table.version.next();
            }
        }
        shared.publish();
        shared
    }

    fn publish(&self) {
        let snapshot = self.table.borrow().clone();
        // Receivers may all be gone between subscriptions; that is fine.
        let _ = self.publisher.send(snapshot);
    }

    fn mutate(
        &self,
        f: impl FnOnce(&mut ClusterMembershipSnapshot),
    ) -> MembershipVersion {
        let version = {
            let mut table = self.table.borrow_mut();
            f(&mut table);
            table.version = table.version.next();
            table.version
        };
        self.publish();
        version
    }
}

#[async_trait::async_trait(?Send)]
impl MembershipService for SharedMembership {
    fn current(&self) -> ClusterMembershipSnapshot {
        self.table.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<ClusterMembershipSnapshot> {
        self.publisher.subscribe()
    }

    async fn refresh_at_least(
        &self,
        version: MembershipVersion,
    ) -> Result<ClusterMembershipSnapshot, MembershipError> {
        let mut receiver = self.subscribe();
        loop {
            let snapshot = receiver.borrow().clone();
            if snapshot.version >= version {
                return Ok(snapshot);
            }
            receiver
                .changed()
                .await
                .map_err(|_| MembershipError::Closed)?;
        }
    }

    async fn register_silo(
        &self,
        silo: SiloAddress,
        status: SiloStatus,
    ) -> Result<MembershipVersion, MembershipError> {
        let version = self.mutate(|table| {
            // A higher generation at the same endpoint supersedes the old
            // incarnation.
            let superseded: Vec<SiloAddress> = table
                .members
                .keys()
                .filter(|existing| silo.is_successor_of(existing))
                .cloned()
                .collect();
            for old in superseded {
                tracing::info!(old = %old, new = %silo, "superseding silo incarnation");
                table.members.insert(old, SiloStatus::Dead);
            }
            table.members.insert(silo.clone(), status);
        });
        tracing::debug!(silo = %silo, %status, %version, "silo registered");
        Ok(version)
    }

    async fn update_status(
        &self,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<MembershipVersion, MembershipError> {
        if !self.table.borrow().members.contains_key(silo) {
            return Err(MembershipError::NotFound(silo.clone()));
        }
        let version = self.mutate(|table| {
            table.members.insert(silo.clone(), status);
        });
        tracing::debug!(silo = %silo, %status, %version, "silo status updated");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn silo(port: u16, generation: u64) -> SiloAddress {
        SiloAddress::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            generation,
        )
    }

    #[tokio::test]
    async fn test_register_and_snapshot() {
        let m = SharedMembership::new();
        let v = m
            .register_silo(silo(5000, 1), SiloStatus::Active)
            .await
            .expect("register");
        assert_eq!(v, MembershipVersion(1));

        let snap = m.current();
        assert_eq!(snap.version, MembershipVersion(1));
        assert_eq!(snap.status_of(&silo(5000, 1)), Some(SiloStatus::Active));
    }

    #[tokio::test]
    async fn test_update_status_bumps_version() {
        let m = SharedMembership::new();
        m.register_silo(silo(5000, 1), SiloStatus::Joining)
            .await
            .expect("register");
        let v = m
            .update_status(&silo(5000, 1), SiloStatus::Active)
            .await
            .expect("update");
        assert_eq!(v, MembershipVersion(2));
    }

    #[tokio::test]
    async fn test_update_status_unknown_silo() {
        let m = SharedMembership::new();
        let result = m.update_status(&silo(9999, 1), SiloStatus::Dead).await;
        assert!(matches!(result, Err(MembershipError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_new_generation_supersedes_old() {
        let m = SharedMembership::new();
        m.register_silo(silo(5000, 1), SiloStatus::Active)
            .await
            .expect("register");
        m.register_silo(silo(5000, 2), SiloStatus::Active)
            .await
            .expect("register");

        let snap = m.current();
        assert_eq!(snap.status_of(&silo(5000, 1)), Some(SiloStatus::Dead));
        assert_eq!(snap.status_of(&silo(5000, 2)), Some(SiloStatus::Active));
    }

    #[tokio::test]
    async fn test_subscribe_sees_updates() {
        let m = SharedMembership::new();
        let mut receiver = m.subscribe();
        assert_eq!(receiver.borrow().version, MembershipVersion(0));

        m.register_silo(silo(5000, 1), SiloStatus::Active)
            .await
            .expect("register");
        receiver.changed().await.expect("update published");
        assert_eq!(receiver.borrow().version, MembershipVersion(1));
    }

    #[tokio::test]
    async fn test_refresh_at_least_returns_immediately_when_current() {
        let m = SharedMembership::new();
        m.register_silo(silo(5000, 1), SiloStatus::Active)
            .await
            .expect("register");

        let snap = m
            .refresh_at_least(MembershipVersion(1))
            .await
            .expect("refresh");
        assert!(snap.version >= MembershipVersion(1));
    }

    #[tokio::test]
    async fn test_observed_versions_never_decrease() {
        let m = SharedMembership::new();
        let mut receiver = m.subscribe();
        let mut last = receiver.borrow().version;

        for port in 5000..5010u16 {
            m.register_silo(silo(port, 1), SiloStatus::Active)
                .await
                .expect("register");
            receiver.changed().await.expect("published");
            let seen = receiver.borrow().version;
            assert!(seen >= last);
            last = seen;
        }
    }
}

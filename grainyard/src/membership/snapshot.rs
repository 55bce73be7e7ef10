//! Versioned cluster membership snapshots.

use grainyard_core::SiloAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Monotonically increasing membership version.
///
/// Every membership change (join, status transition) bumps the version.
/// Observers use it to order snapshots and to detect staleness; a sequence
/// of observed versions is always non-decreasing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// Create version 0 (initial).
    pub fn new() -> Self {
        Self(0)
    }

    /// Return the next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Status of a silo in the cluster.
///
/// Silos join, become active, then drain in two phases before dying:
/// `ShuttingDown` refuses new work while handing off directory state,
/// `Stopping` covers the final drain after handoff completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    /// Announced but not yet serving.
    Joining,
    /// Fully operational.
    Active,
    /// Graceful shutdown requested; directory handoff in progress.
    ShuttingDown,
    /// Handoff done, draining in-flight work.
    Stopping,
    /// Crashed or completed shutdown.
    Dead,
}

impl SiloStatus {
    /// True for statuses on the way out of the cluster.
    ///
    /// Terminating silos never own directory partitions.
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            SiloStatus::ShuttingDown | SiloStatus::Stopping | SiloStatus::Dead
        )
    }
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joining => write!(f, "Joining"),
            Self::Active => write!(f, "Active"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// Immutable snapshot of cluster membership at a specific version.
///
/// Readers always see a consistent value; the membership service swaps
/// whole snapshots, never mutates one in place.
#[derive(Debug, Clone, Default)]
pub struct ClusterMembershipSnapshot {
    /// All known silos, keyed by address.
    pub members: HashMap<SiloAddress, SiloStatus>,
    /// Version of this snapshot.
    pub version: MembershipVersion,
}

impl ClusterMembershipSnapshot {
    /// Create an empty snapshot at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses of all Active silos.
    pub fn active_silos(&self) -> Vec<SiloAddress> {
        self.members
            .iter()
            .filter(|(_, status)| **status == SiloStatus::Active)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Status of a specific silo, or `None` if unknown.
    pub fn status_of(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.members.get(silo).copied()
    }

    /// All silos carrying the given status.
    pub fn silos_with_status(&self, status: SiloStatus) -> Vec<SiloAddress> {
        self.members
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// True when the silo is known and not terminating.
    ///
    /// Directory entries may only reference silos passing this check
    /// (Active or ShuttingDown — a ShuttingDown silo still hosts
    /// activations while its partition drains).
    pub fn can_host_activations(&self, silo: &SiloAddress) -> bool {
        matches!(
            self.status_of(silo),
            Some(SiloStatus::Active) | Some(SiloStatus::ShuttingDown)
        )
    }
}

/// Change set between two consecutive snapshots, delivered to subscribers.
#[derive(Debug, Clone, Default)]
pub struct MembershipDelta {
    /// Silos present now that were absent before.
    pub added: Vec<SiloAddress>,
    /// Silos absent now (or newly Dead) that were live before.
    pub removed: Vec<SiloAddress>,
    /// Silos whose status changed between two live states.
    pub status_changed: Vec<(SiloAddress, SiloStatus)>,
}

impl MembershipDelta {
    /// Compute the delta from `previous` to `current`.
    pub fn between(
        previous: &ClusterMembershipSnapshot,
        current: &ClusterMembershipSnapshot,
    ) -> Self {
        let mut delta = MembershipDelta::default();

        for (addr, status) in &current.members {
            match previous.members.get(addr) {
                None => {
                    if *status == SiloStatus::Dead {
                        // Never observed alive; nothing to react to.
                        continue;
                    }
                    delta.added.push(addr.clone());
                }
                Some(old) if old == status => {}
                Some(old) => {
                    if *status == SiloStatus::Dead && *old != SiloStatus::Dead {
                        delta.removed.push(addr.clone());
                    } else {
                        delta.status_changed.push((addr.clone(), *status));
                    }
                }
            }
        }

        for addr in previous.members.keys() {
            if !current.members.contains_key(addr) {
                delta.removed.push(addr.clone());
            }
        }

        delta
    }

    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.status_changed.is_empty()
    }
}

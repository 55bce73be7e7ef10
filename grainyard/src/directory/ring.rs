//! Consistent-hash ring derived from a membership snapshot.

use crate::membership::{ClusterMembershipSnapshot, MembershipVersion, SiloStatus};
use grainyard_core::{GrainId, SiloAddress};

/// Directory view of the cluster: Active silos ordered by consistent hash.
///
/// Derived from a [`ClusterMembershipSnapshot`]; terminating silos never
/// appear, so they can never own partitions. The owner of a grain identity
/// is the nearest active member with ring hash `>=` the grain's uniform
/// hash, wrapping past the top of the hash space.
///
/// # Invariants
///
/// - Entries are sorted by `(hash, address)`; ties on hash are broken by
///   address ordering so every silo computes the identical ring
/// - An empty ring has no owner for any grain (`partition_owner` returns
///   `None`)
#[derive(Debug, Clone)]
pub struct DirectoryRing {
    entries: Vec<(u32, SiloAddress)>,
    version: MembershipVersion,
}

impl DirectoryRing {
    /// Build the ring from a membership snapshot.
    pub fn from_snapshot(snapshot: &ClusterMembershipSnapshot) -> Self {
        let mut entries: Vec<(u32, SiloAddress)> = snapshot
            .members
            .iter()
            .filter(|(_, status)| **status == SiloStatus::Active)
            .map(|(silo, _)| (silo.consistent_hash(), silo.clone()))
            .collect();
        entries.sort();
        Self {
            entries,
            version: snapshot.version,
        }
    }

    /// Version of the snapshot this ring was derived from.
    pub fn version(&self) -> MembershipVersion {
        self.version
    }

    /// True when no active silo exists.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of ring members.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The silo owning an arbitrary 32-bit hash.
    pub fn owner_of_hash(&self, hash: u32) -> Option<&SiloAddress> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self
            .entries
            .partition_point(|(entry_hash, _)| *entry_hash < hash);
        let index = if index == self.entries.len() { 0 } else { index };
        Some(&self.entries[index].1)
    }

    /// The silo owning a grain's directory partition.
    pub fn partition_owner(&self, grain: &GrainId) -> Option<&SiloAddress> {
        self.owner_of_hash(grain.uniform_hash())
    }

    /// True when `silo` is a ring member.
    pub fn contains(&self, silo: &SiloAddress) -> bool {
        self.position_of(silo).is_some()
    }

    /// Ring predecessor of `silo`: the member immediately counterclockwise.
    ///
    /// `None` when the silo is absent or alone on the ring.
    pub fn predecessor_of(&self, silo: &SiloAddress) -> Option<&SiloAddress> {
        let position = self.position_of(silo)?;
        if self.entries.len() < 2 {
            return None;
        }
        let index = (position + self.entries.len() - 1) % self.entries.len();
        Some(&self.entries[index].1)
    }

    /// Ring successor of `silo`: the member immediately clockwise.
    ///
    /// The successor inherits the silo's partition range when it leaves.
    /// `None` when the silo is absent or alone on the ring.
    pub fn successor_of(&self, silo: &SiloAddress) -> Option<&SiloAddress> {
        let position = self.position_of(silo)?;
        if self.entries.len() < 2 {
            return None;
        }
        let index = (position + 1) % self.entries.len();
        Some(&self.entries[index].1)
    }

    /// All ring members in hash order.
    pub fn members(&self) -> impl Iterator<Item = &SiloAddress> {
        self.entries.iter().map(|(_, silo)| silo)
    }

    fn position_of(&self, silo: &SiloAddress) -> Option<usize> {
        self.entries.iter().position(|(_, s)| s == silo)
    }
}

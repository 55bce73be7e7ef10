//! Cluster membership: versioned snapshots of live and terminating silos.

mod service;
mod snapshot;

pub use service::{MembershipService, SharedMembership};
pub use snapshot::{ClusterMembershipSnapshot, MembershipDelta, MembershipVersion, SiloStatus};

//! Control-plane messages exchanged between silo directory partitions.
//!
//! These travel as the body of system-target frames; every request carries
//! a `hop_count` and the receiving silo rejects past the hop limit.

use grainyard_core::{GrainAddress, GrainId, SiloAddress};
use serde::{Deserialize, Serialize};

/// Interface id of the directory system target.
pub const DIRECTORY_INTERFACE_ID: u32 = 1;

/// Method ids for directory operations (observability; the request body is
/// self-describing).
pub mod method_ids {
    pub const REGISTER: u32 = 1;
    pub const UNREGISTER: u32 = 2;
    pub const UNREGISTER_MANY: u32 = 3;
    pub const LOOKUP: u32 = 4;
    pub const LOOKUP_MANY: u32 = 5;
    pub const DELETE: u32 = 6;
    pub const ACCEPT_SPLIT: u32 = 7;
    pub const REMOVE_HANDOFF_PARTITION: u32 = 8;
}

/// Grain identity of a silo's directory system target.
pub fn directory_target(silo: &SiloAddress) -> GrainId {
    GrainId {
        namespace: "sys".to_string(),
        kind: "Directory".to_string(),
        key: silo.to_string(),
    }
}

/// Why an activation is being unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnregistrationCause {
    /// Normal deactivation completed.
    DeactivationCompleted,
    /// `on_activate` failed; the slot is being torn down.
    ActivationFailed,
    /// Administrative removal.
    Forced,
}

/// A directory request, executed on the partition owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirectoryRequest {
    Register {
        address: GrainAddress,
        single_activation: bool,
        hop_count: u8,
    },
    Unregister {
        address: GrainAddress,
        cause: UnregistrationCause,
        hop_count: u8,
    },
    UnregisterMany {
        addresses: Vec<GrainAddress>,
        cause: UnregistrationCause,
        hop_count: u8,
    },
    Lookup {
        grain: GrainId,
        hop_count: u8,
    },
    LookupMany {
        /// `(grain, cached etag)` pairs; an unchanged entry comes back as
        /// `NotChanged` instead of the full address list.
        queries: Vec<(GrainId, u64)>,
        hop_count: u8,
    },
    Delete {
        grain: GrainId,
        hop_count: u8,
    },
    /// Handoff: the sender transfers ownership of these registrations.
    AcceptSplit {
        source: SiloAddress,
        addresses: Vec<GrainAddress>,
    },
    /// Drop entries previously accepted from `source`.
    RemoveHandoffPartition {
        source: SiloAddress,
    },
}

impl DirectoryRequest {
    /// Method id for frame headers.
    pub fn method_id(&self) -> u32 {
        match self {
            Self::Register { .. } => method_ids::REGISTER,
            Self::Unregister { .. } => method_ids::UNREGISTER,
            Self::UnregisterMany { .. } => method_ids::UNREGISTER_MANY,
            Self::Lookup { .. } => method_ids::LOOKUP,
            Self::LookupMany { .. } => method_ids::LOOKUP_MANY,
            Self::Delete { .. } => method_ids::DELETE,
            Self::AcceptSplit { .. } => method_ids::ACCEPT_SPLIT,
            Self::RemoveHandoffPartition { .. } => method_ids::REMOVE_HANDOFF_PARTITION,
        }
    }

    /// The grain identity this request routes by, when it routes by one.
    ///
    /// Handoff messages address a silo, not a partition slot.
    pub fn routing_grain(&self) -> Option<&GrainId> {
        match self {
            Self::Register { address, .. } | Self::Unregister { address, .. } => {
                Some(&address.grain)
            }
            Self::Lookup { grain, .. } | Self::Delete { grain, .. } => Some(grain),
            Self::UnregisterMany { .. }
            | Self::LookupMany { .. }
            | Self::AcceptSplit { .. }
            | Self::RemoveHandoffPartition { .. } => None,
        }
    }

    /// Forwarding hop count carried by this request.
    pub fn hop_count(&self) -> u8 {
        match self {
            Self::Register { hop_count, .. }
            | Self::Unregister { hop_count, .. }
            | Self::UnregisterMany { hop_count, .. }
            | Self::Lookup { hop_count, .. }
            | Self::LookupMany { hop_count, .. }
            | Self::Delete { hop_count, .. } => *hop_count,
            Self::AcceptSplit { .. } | Self::RemoveHandoffPartition { .. } => 0,
        }
    }

    /// Copy of this request with the hop count incremented for forwarding.
    pub fn forwarded(&self) -> Self {
        let mut next = self.clone();
        match &mut next {
            Self::Register { hop_count, .. }
            | Self::Unregister { hop_count, .. }
            | Self::UnregisterMany { hop_count, .. }
            | Self::Lookup { hop_count, .. }
            | Self::LookupMany { hop_count, .. }
            | Self::Delete { hop_count, .. } => *hop_count += 1,
            Self::AcceptSplit { .. } | Self::RemoveHandoffPartition { .. } => {}
        }
        next
    }
}

/// Per-grain outcome of a [`DirectoryRequest::LookupMany`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LookupOutcome {
    Found {
        addresses: Vec<GrainAddress>,
        etag: u64,
    },
    NotChanged,
    NotFound,
}

/// Reasons a directory request was refused by the receiving silo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryRejectionKind {
    /// Forwarded more times than the hop limit allows. Definite.
    HopLimitExceeded,
    /// The ring is empty; nobody owns the partition. Definite.
    NoOwner,
    /// The receiving silo could not reach the real owner. Transient from
    /// the original caller's point of view.
    Unavailable,
}

/// Reply to a [`DirectoryRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirectoryResponse {
    /// Registration outcome; `address` is the winner (which may differ from
    /// the caller's own when the caller lost the race).
    Registered { address: GrainAddress, etag: u64 },
    /// Lookup hit.
    Found {
        addresses: Vec<GrainAddress>,
        etag: u64,
    },
    /// Lookup miss.
    NotFound,
    /// Batched lookup outcomes, in query order.
    LookupManyResults { results: Vec<LookupOutcome> },
    /// Unregister / delete / handoff acknowledgement.
    Done,
    /// Definite refusal.
    Rejected {
        kind: DirectoryRejectionKind,
        reason: String,
    },
}

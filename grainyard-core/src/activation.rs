//! Activation identity and the full activation address triple.

use crate::{GrainId, SiloAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Random 128-bit identity minted when a grain is instantiated in memory.
///
/// Successive incarnations of the same [`GrainId`] get distinct activation
/// ids, which is how the directory and its caches tell a stale address from
/// a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationId(pub u128);

impl ActivationId {
    /// Mint a fresh random activation id.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Complete location of one activation: silo, grain identity, incarnation.
///
/// # Invariants
///
/// - Equality considers all three components
/// - The same grain id can map to different addresses over time
///   (deactivation then reactivation elsewhere), never to two addresses
///   simultaneously for single-activation grains
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainAddress {
    pub silo: SiloAddress,
    pub grain: GrainId,
    pub activation: ActivationId,
}

impl GrainAddress {
    pub fn new(silo: SiloAddress, grain: GrainId, activation: ActivationId) -> Self {
        Self {
            silo,
            grain,
            activation,
        }
    }
}

impl fmt::Display for GrainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.grain, self.activation, self.silo)
    }
}

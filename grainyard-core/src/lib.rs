//! Core identity and addressing types for the grainyard virtual-actor runtime.
//!
//! Everything a silo, a grain, or a wire frame needs to name things lives
//! here: [`SiloAddress`] for server processes, [`GrainId`] for logical
//! actors, [`ActivationId`] for in-memory incarnations, [`GrainAddress`]
//! for the full triple, and [`CorrelationId`] for request/response
//! matching.
//!
//! These types are deliberately free of runtime machinery so that both the
//! silo runtime and external clients can share them.
//!
//! # Hashing
//!
//! Silo addresses and grain identities hash into the same 32-bit space
//! ([`SiloAddress::consistent_hash`], [`GrainId::uniform_hash`]) so that the
//! directory can place both on a single consistent-hash ring. The hash is
//! seeded rapidhash over the canonical string rendering — stable across
//! processes, architectures, and releases, unlike `DefaultHasher`.

pub mod activation;
pub mod correlation;
pub mod grain_id;
pub mod silo_address;

pub use activation::{ActivationId, GrainAddress};
pub use correlation::CorrelationId;
pub use grain_id::{GrainId, GrainIdError};
pub use silo_address::{SiloAddress, SiloAddressError};

use std::hash::{Hash, Hasher};

/// Seed for all stable 32-bit hashes in the runtime.
///
/// Fixed so that every silo, at every generation, computes identical ring
/// positions for identical inputs.
const STABLE_HASH_SEED: u64 = 0x6772_6169_6e79_6172; // "grainyar"

/// Stable 32-bit hash of any `Hash` value, shared by ring placement.
///
/// Truncates a seeded 64-bit rapidhash; uniformity of the low 32 bits is
/// what ring placement relies on.
pub(crate) fn stable_hash_32<T: Hash + ?Sized>(value: &T) -> u32 {
    let mut hasher = rapidhash::RapidHasher::new(STABLE_HASH_SEED);
    value.hash(&mut hasher);
    hasher.finish() as u32
}

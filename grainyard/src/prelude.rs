//! Convenience re-exports for grain authors and hosts.

pub use crate::config::SiloConfig;
pub use crate::error::{CallError, CatalogError, DirectoryError, SiloError};
pub use crate::grain::{
    DeactivationReason, Grain, GrainCell, GrainContext, GrainKind, GrainRef, MethodTable,
};
pub use crate::membership::{MembershipService, SharedMembership, SiloStatus};
pub use crate::messaging::{InProcessNetwork, MessageFlags, TcpTransport};
pub use crate::runtime::{Silo, SiloBuilder};
pub use grainyard_core::{ActivationId, CorrelationId, GrainAddress, GrainId, SiloAddress};

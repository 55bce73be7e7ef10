//! The distributed grain directory: partition, ring, cache, routing.

mod cache;
mod local;
mod messages;
mod partition;
mod ring;
mod target;

pub use cache::DirectoryCache;
pub use local::{DirectoryTransport, LocalGrainDirectory};
pub use messages::{
    directory_target, method_ids, DirectoryRejectionKind, DirectoryRequest, DirectoryResponse,
    LookupOutcome, UnregistrationCause, DIRECTORY_INTERFACE_ID,
};
pub use partition::{ActivationEntry, GrainDirectoryPartition, GrainInfo, RegistrationResult};
pub use ring::DirectoryRing;
pub use target::DirectoryTarget;

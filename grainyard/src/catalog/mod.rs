//! Activation lifecycle: catalog, records, collection.

mod activation;
#[allow(clippy::module_inception)]
mod catalog;
mod collector;
mod working_set;

pub use activation::{Activation, ActivationState};
pub use catalog::{Catalog, CreateOutcome};
pub use collector::{ActivationCollector, CollectionTicket};
pub use working_set::WorkingSet;

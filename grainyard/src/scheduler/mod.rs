//! Cooperative per-activation scheduling primitives.
//!
//! The scheduler layer owns the mechanism — work items, the two-lane FIFO
//! queue each activation carries, and the silo-wide pool controls. Policy
//! (when the next item may begin a turn, reentrancy, response plumbing)
//! lives with the activation pump in the catalog.

mod pool;
mod queue;
mod work_item;

pub use pool::{PumpGuard, SiloScheduler};
pub use queue::ActivationQueue;
pub use work_item::{Lane, WorkItem, WorkItemKind};

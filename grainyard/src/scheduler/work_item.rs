//! Work items: the unit the per-activation scheduler runs.

use crate::messaging::{Message, MessageFlags};
use std::time::Instant;

/// What a work item does when its turn begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemKind {
    /// Dispatch a request or one-way message into the grain.
    Invocation,
    /// Deliver a response to a suspended turn's continuation.
    Response,
    /// Fire a grain timer.
    Timer,
    /// Runtime-internal work; always runs, even with application turns
    /// stopped.
    SystemPriority,
}

/// The two silo-wide scheduling lanes.
///
/// System items always run; application items are dropped while the silo
/// is in "application turns stopped" mode. Within a lane, items are strict
/// FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Application,
    System,
}

impl WorkItemKind {
    /// Lane an item of this kind runs in.
    pub fn lane(&self) -> Lane {
        match self {
            WorkItemKind::Invocation => Lane::Application,
            WorkItemKind::Response | WorkItemKind::Timer | WorkItemKind::SystemPriority => {
                Lane::System
            }
        }
    }
}

/// One schedulable unit: a message bound for a specific activation.
#[derive(Debug)]
pub struct WorkItem {
    pub kind: WorkItemKind,
    pub message: Message,
    pub enqueued_at: Instant,
}

impl WorkItem {
    pub fn new(kind: WorkItemKind, message: Message) -> Self {
        Self {
            kind,
            message,
            enqueued_at: Instant::now(),
        }
    }

    /// True when this item may interleave with read-only turns.
    pub fn is_read_only(&self) -> bool {
        self.message.flags.contains(MessageFlags::READ_ONLY)
    }

    /// True when this item may interleave with any turn.
    pub fn always_interleaves(&self) -> bool {
        self.message.flags.contains(MessageFlags::ALWAYS_INTERLEAVE)
    }
}

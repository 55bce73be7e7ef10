//! The directory system target: remote-facing entry to the partition.
//!
//! One per silo. Every partition mutation from a peer runs as a work item
//! on this activation; its turns interleave (forwarded requests await
//! their peers), but mutations themselves are synchronous segments, so the
//! partition stays single-writer.

use crate::directory::{DirectoryRequest, LocalGrainDirectory, DIRECTORY_INTERFACE_ID};
use crate::error::CallError;
use crate::grain::{DeactivationReason, GrainContext, GrainKind, GrainRuntime, TurnFuture};
use crate::messaging::{Message, MessageFlags};
use async_trait::async_trait;
use std::rc::Rc;

/// Grain-runtime adapter exposing [`LocalGrainDirectory::handle_request`]
/// as a system target.
pub struct DirectoryTarget {
    directory: Rc<LocalGrainDirectory>,
}

impl DirectoryTarget {
    pub fn new(directory: Rc<LocalGrainDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait(?Send)]
impl GrainRuntime for DirectoryTarget {
    fn interface_id(&self) -> u32 {
        DIRECTORY_INTERFACE_ID
    }

    fn grain_kind(&self) -> GrainKind {
        GrainKind::SystemTarget
    }

    async fn activate(&self, _ctx: &GrainContext) -> Result<(), CallError> {
        Ok(())
    }

    async fn deactivate(&self, _reason: DeactivationReason) -> Result<(), CallError> {
        Ok(())
    }

    fn create_turn(&self, message: &Message, _ctx: GrainContext) -> Result<TurnFuture, CallError> {
        let request: DirectoryRequest = serde_json::from_slice(&message.body)
            .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))?;
        let directory = self.directory.clone();
        Ok(Box::pin(async move {
            let response = directory.handle_request(request).await;
            serde_json::to_value(response)
                .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))
        }))
    }

    fn method_flags(&self, _method_id: u32) -> MessageFlags {
        MessageFlags::ALWAYS_INTERLEAVE
    }
}

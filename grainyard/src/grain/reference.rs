//! Typed grain references: location-transparent proxies.

use crate::error::CallError;
use crate::grain::Grain;
use crate::messaging::{decode_turn_body, Message, MessageCenter};
use grainyard_core::GrainId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::Duration;

/// Strongly-typed reference to a grain of class `G`.
///
/// Holds only an identity — no location. The first call triggers directory
/// resolution and, if needed, activation on some silo; the reference stays
/// valid across deactivations and migrations. Cloning copies the identity.
///
/// # Example
///
/// ```rust,ignore
/// let thermostat: GrainRef<Thermostat> = silo.grain_ref("roomA");
/// thermostat.call::<_, ()>(methods::ON_UPDATE, &22).await?;
/// ```
pub struct GrainRef<G: Grain> {
    id: GrainId,
    sender: GrainId,
    center: Rc<MessageCenter>,
    _phantom: PhantomData<G>,
}

impl<G: Grain> Clone for GrainRef<G> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            sender: self.sender.clone(),
            center: self.center.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<G: Grain> GrainRef<G> {
    pub fn new(id: GrainId, sender: GrainId, center: Rc<MessageCenter>) -> Self {
        Self {
            id,
            sender,
            center,
            _phantom: PhantomData,
        }
    }

    /// Identity of the referenced grain.
    pub fn grain_id(&self) -> &GrainId {
        &self.id
    }

    /// Invoke a method and await its response, with the default deadline.
    pub async fn call<Req, Res>(&self, method_id: u32, request: &Req) -> Result<Res, CallError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.call_with_timeout(method_id, request, self.center.default_timeout())
            .await
    }

    /// Invoke a method with an explicit deadline.
    ///
    /// When the deadline fires, the call completes with
    /// [`CallError::Timeout`]; a response arriving later is dropped.
    pub async fn call_with_timeout<Req, Res>(
        &self,
        method_id: u32,
        request: &Req,
        timeout: Duration,
    ) -> Result<Res, CallError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let message = self.build(method_id, request, Some(timeout))?;
        let response = self.center.invoke(message).await?;
        decode_turn_body(&response.body)
    }

    /// Fire-and-forget invocation; no response, best-effort delivery.
    ///
    /// A one-way that finds no activation does not retry itself, but it
    /// leaves the sender's cache corrected so the next call lands.
    pub async fn send<Req: Serialize>(&self, method_id: u32, request: &Req) -> Result<(), CallError> {
        let mut message = self.build(method_id, request, None)?;
        message.direction = crate::messaging::Direction::OneWay;
        self.center.send_oneway(message).await
    }

    fn build<Req: Serialize>(
        &self,
        method_id: u32,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Message, CallError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))?;
        Ok(Message::request(
            self.center.next_correlation(),
            self.center.local_silo().clone(),
            self.sender.clone(),
            self.id.clone(),
            G::INTERFACE_ID,
            method_id,
            body.into(),
            timeout.unwrap_or_else(|| self.center.default_timeout()),
        ))
    }
}

//! Invocation context handed to every turn.

use crate::config::SiloConfig;
use crate::error::CallError;
use crate::grain::{Grain, GrainRef};
use crate::messaging::{decode_turn_body, Message, MessageCenter};
use grainyard_core::{GrainAddress, GrainId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::rc::Rc;
use std::time::Duration;

/// Hooks back into the activation hosting the current turn.
///
/// Implemented by the catalog's activation record; a trait seam so grain
/// code never reaches into catalog internals.
pub trait ActivationControl {
    /// Keep the activation out of idle collection for at least `period`.
    fn delay_deactivation(&self, period: Duration);

    /// Ask for deactivation as soon as the queue drains.
    fn deactivate_on_idle(&self);

    /// Enqueue a timer tick on this activation's queue.
    fn enqueue_timer(&self, message: Message) -> Result<(), crate::error::SchedulerError>;
}

/// Capabilities available to a grain turn: identity, sub-calls, lifetime
/// control.
///
/// Cloned into every turn future; cheap (a few `Rc`s).
#[derive(Clone)]
pub struct GrainContext {
    address: GrainAddress,
    center: Rc<MessageCenter>,
    config: Rc<SiloConfig>,
    control: Option<Rc<dyn ActivationControl>>,
}

impl GrainContext {
    pub fn new(
        address: GrainAddress,
        center: Rc<MessageCenter>,
        config: Rc<SiloConfig>,
        control: Option<Rc<dyn ActivationControl>>,
    ) -> Self {
        Self {
            address,
            center,
            config,
            control,
        }
    }

    /// Full address of the activation running this turn.
    pub fn address(&self) -> &GrainAddress {
        &self.address
    }

    /// Identity of the grain running this turn.
    pub fn grain_id(&self) -> &GrainId {
        &self.address.grain
    }

    /// Typed reference to another grain of class `G` in this namespace.
    pub fn reference<G: Grain>(&self, key: impl Into<String>) -> GrainRef<G> {
        GrainRef::new(
            GrainId {
                namespace: self.address.grain.namespace.clone(),
                kind: G::KIND.to_string(),
                key: key.into(),
            },
            self.address.grain.clone(),
            self.center.clone(),
        )
    }

    /// Invoke a method on an arbitrary grain identity.
    ///
    /// This is the untyped escape hatch; prefer [`GrainContext::reference`]
    /// when the callee's class is known at compile time.
    pub async fn call<Req, Res>(
        &self,
        target: GrainId,
        interface_id: u32,
        method_id: u32,
        request: &Req,
    ) -> Result<Res, CallError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)
            .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))?;
        let message = Message::request(
            self.center.next_correlation(),
            self.center.local_silo().clone(),
            self.address.grain.clone(),
            target,
            interface_id,
            method_id,
            body.into(),
            self.config.response_timeout,
        );
        let response = self.center.invoke(message).await?;
        decode_turn_body(&response.body)
    }

    /// Keep this activation alive for at least `period`.
    pub fn delay_deactivation(&self, period: Duration) {
        if let Some(control) = &self.control {
            control.delay_deactivation(period);
        }
    }

    /// Deactivate this activation once its queue drains.
    pub fn deactivate_on_idle(&self) {
        if let Some(control) = &self.control {
            control.deactivate_on_idle();
        }
    }

    /// Suspend the turn for `period`; a runtime-provided await point.
    pub async fn delay(&self, period: Duration) {
        tokio::time::sleep(period).await;
    }

    /// Fire a method on this grain after `period`, as a timer work item.
    ///
    /// The tick runs on the system lane, so it fires even with
    /// application turns stopped; it does not extend the idle clock. A
    /// tick arriving after deactivation began is dropped.
    pub fn schedule_timer<Req: Serialize>(
        &self,
        method_id: u32,
        request: &Req,
        period: Duration,
        interface_id: u32,
    ) -> Result<(), CallError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))?;
        let mut tick = Message::oneway(
            self.center.local_silo().clone(),
            self.address.grain.clone(),
            self.address.grain.clone(),
            interface_id,
            method_id,
            body.into(),
        );
        tick.flags |= crate::messaging::MessageFlags::SUPPRESS_KEEP_ALIVE;
        tick.target_silo = Some(self.center.local_silo().clone());

        let control = self.control.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(period).await;
            let Some(control) = control else {
                return;
            };
            if let Err(error) = control.enqueue_timer(tick) {
                tracing::debug!(%error, "timer tick dropped");
            }
        });
        Ok(())
    }
}

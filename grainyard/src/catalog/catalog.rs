//! The catalog: owner of all local activation records.

use crate::catalog::activation::{run_turn_pump, DrainHandler, TurnRunner};
use crate::catalog::{Activation, ActivationCollector, ActivationState, WorkingSet};
use crate::config::SiloConfig;
use crate::directory::{LocalGrainDirectory, UnregistrationCause};
use crate::error::{CallError, CatalogError};
use crate::grain::{DeactivationReason, GrainContext, GrainKind, GrainRegistry};
use crate::messaging::{encode_turn_body, Direction, Message, MessageCenter};
use crate::scheduler::{SiloScheduler, WorkItem, WorkItemKind};
use grainyard_core::{ActivationId, GrainAddress, GrainId, SiloAddress};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Result of asking the catalog to materialize an activation.
#[derive(Debug)]
pub enum CreateOutcome {
    /// The activation lives (or now lives) on this silo.
    Local(Rc<Activation>),
    /// Another silo won the single-activation race; route there.
    Remote(GrainAddress),
}

/// Registry of locally-hosted activations.
///
/// Creates, activates, and deactivates grains, coordinating with the
/// directory on (de)registration. Records are held behind the grain-id
/// index; no component traverses into another's internals — the message
/// center and directory are injected handles.
///
/// # Invariants
///
/// - Single activation: the silo that wins the directory Register keeps
///   its activation; losers abandon theirs without running user code
/// - State monotonicity: records only move forward through
///   [`ActivationState`]
pub struct Catalog {
    local: SiloAddress,
    config: Rc<SiloConfig>,
    registry: GrainRegistry,
    activations: RefCell<HashMap<GrainId, Rc<Activation>>>,
    collector: Rc<ActivationCollector>,
    working_set: WorkingSet,
    scheduler: Rc<SiloScheduler>,
    center: RefCell<Option<Rc<MessageCenter>>>,
    directory: RefCell<Option<Rc<LocalGrainDirectory>>>,
    fatal_handler: RefCell<Option<Rc<dyn Fn(String)>>>,
}

impl Catalog {
    pub fn new(
        local: SiloAddress,
        config: Rc<SiloConfig>,
        registry: GrainRegistry,
        scheduler: Rc<SiloScheduler>,
    ) -> Rc<Self> {
        let collector = Rc::new(ActivationCollector::new(config.collection_quantum));
        Rc::new(Self {
            local,
            config,
            registry,
            activations: RefCell::new(HashMap::new()),
            working_set: WorkingSet::new(collector.clone()),
            collector,
            scheduler,
            center: RefCell::new(None),
            directory: RefCell::new(None),
            fatal_handler: RefCell::new(None),
        })
    }

    /// Wire the message center (runtime startup).
    pub fn set_center(&self, center: Rc<MessageCenter>) {
        *self.center.borrow_mut() = Some(center);
    }

    /// Wire the local grain directory (runtime startup).
    pub fn set_directory(&self, directory: Rc<LocalGrainDirectory>) {
        *self.directory.borrow_mut() = Some(directory);
    }

    /// Install the fatal-error handler for failed system items.
    pub fn set_fatal_handler(&self, handler: Rc<dyn Fn(String)>) {
        *self.fatal_handler.borrow_mut() = Some(handler);
    }

    fn center(&self) -> Result<Rc<MessageCenter>, CatalogError> {
        self.center
            .borrow()
            .clone()
            .ok_or_else(|| CatalogError::ActivationFailed("message center not wired".into()))
    }

    fn directory(&self) -> Result<Rc<LocalGrainDirectory>, CatalogError> {
        self.directory
            .borrow()
            .clone()
            .ok_or_else(|| CatalogError::ActivationFailed("directory not wired".into()))
    }

    pub fn collector(&self) -> &Rc<ActivationCollector> {
        &self.collector
    }

    pub fn local_silo(&self) -> &SiloAddress {
        &self.local
    }

    /// Number of live (non-Invalid) activation records.
    pub fn activation_count(&self) -> usize {
        self.activations.borrow().len()
    }

    /// Existing activation for a grain, if any.
    pub fn get(&self, grain: &GrainId) -> Option<Rc<Activation>> {
        self.activations.borrow().get(grain).cloned()
    }

    /// Return a local Valid (or becoming-valid) activation, creating one
    /// if needed.
    ///
    /// Creation reserves the slot first (the per-grain creation lock on a
    /// single-threaded silo), registers with the directory for stateful
    /// grains, and only then runs `on_activate`. Losing the registration
    /// race yields [`CreateOutcome::Remote`] and the reserved slot dies
    /// `Creating → Invalid` without ever running user code.
    pub async fn get_or_create_activation(
        self: &Rc<Self>,
        grain: GrainId,
    ) -> Result<CreateOutcome, CatalogError> {
        if let Some(existing) = self.get(&grain) {
            if existing.is_deactivating() {
                return Err(CatalogError::Deactivating(grain));
            }
            return Ok(CreateOutcome::Local(existing));
        }

        let class = self
            .registry
            .get(&grain.kind)
            .ok_or_else(|| CatalogError::UnknownGrainKind(grain.kind.clone()))?;

        let address = GrainAddress::new(self.local.clone(), grain.clone(), ActivationId::random());
        let runtime = class.instantiate(&grain);
        let reentrant = class.reentrant || self.config.is_reentrant(&grain.kind);
        let age_limit = class
            .age_limit
            .unwrap_or_else(|| self.config.collection_age(&grain.kind));
        let activation = Activation::new(
            address.clone(),
            grain.kind.clone(),
            class.grain_kind,
            reentrant,
            age_limit,
            runtime,
        );

        // Reserve the slot: concurrent callers find this record and wait
        // on its queue instead of double-creating.
        self.activations
            .borrow_mut()
            .insert(grain.clone(), activation.clone());

        let registered = class.grain_kind == GrainKind::Stateful;
        if registered {
            let directory = self.directory()?;
            match directory.register_single(address.clone()).await {
                Ok(result) if result.address == address => {}
                Ok(result) => {
                    tracing::debug!(
                        loser = %address,
                        winner = %result.address,
                        "lost single-activation race"
                    );
                    let _ = activation.try_transition(ActivationState::Invalid);
                    self.remove_record(&activation);
                    self.bounce_queue(&activation, &result.address);
                    return Ok(CreateOutcome::Remote(result.address));
                }
                Err(error) => {
                    let _ = activation.try_transition(ActivationState::Invalid);
                    self.remove_record(&activation);
                    return Err(error.into());
                }
            }
        }

        self.finish_creation(activation.clone(), registered).await?;
        Ok(CreateOutcome::Local(activation))
    }

    /// Pre-create a system target activation (silo startup).
    pub async fn ensure_system_target(
        self: &Rc<Self>,
        grain: GrainId,
    ) -> Result<Rc<Activation>, CatalogError> {
        match self.get_or_create_activation(grain).await? {
            CreateOutcome::Local(activation) => Ok(activation),
            CreateOutcome::Remote(address) => Err(CatalogError::ActivationFailed(format!(
                "system target unexpectedly remote: {address}"
            ))),
        }
    }

    async fn finish_creation(
        self: &Rc<Self>,
        activation: Rc<Activation>,
        registered: bool,
    ) -> Result<(), CatalogError> {
        activation.try_transition(ActivationState::Activating)?;

        let ctx = GrainContext::new(
            activation.address.clone(),
            self.center()?,
            self.config.clone(),
            Some(activation.clone() as Rc<dyn crate::grain::ActivationControl>),
        );
        // User-supplied initialization runs on the activation's serial
        // context: no turn can begin before the pump starts below.
        if let Err(error) = activation.runtime().activate(&ctx).await {
            tracing::warn!(activation = %activation.address, %error, "on_activate failed");
            if registered {
                if let Ok(directory) = self.directory() {
                    if let Err(unregister_error) = directory
                        .unregister(activation.address.clone(), UnregistrationCause::ActivationFailed)
                        .await
                    {
                        tracing::warn!(%unregister_error, "unregister after failed activation");
                    }
                }
            }
            let _ = activation.try_transition(ActivationState::Invalid);
            self.remove_record(&activation);
            self.fail_pending(&activation, &error.to_string());
            return Err(CatalogError::ActivationFailed(error.to_string()));
        }

        activation.try_transition(ActivationState::Valid)?;
        self.working_set.observe_activated(&activation);

        let runner = self.make_turn_runner(&activation);
        let on_drained = self.make_drain_handler();
        tokio::task::spawn_local(run_turn_pump(
            activation.clone(),
            self.scheduler.clone(),
            runner,
            on_drained,
        ));
        tracing::debug!(activation = %activation.address, "activation valid");
        Ok(())
    }

    /// Request deactivation of a local activation; the pump drains the
    /// queue, runs teardown, and unregisters.
    pub fn deactivate(&self, grain: &GrainId, reason: DeactivationReason) -> bool {
        match self.get(grain) {
            Some(activation) => activation.begin_deactivation(reason),
            None => false,
        }
    }

    /// Begin deactivation of every local activation (silo shutdown).
    pub fn deactivate_all(&self, reason: DeactivationReason) {
        let all: Vec<Rc<Activation>> = self.activations.borrow().values().cloned().collect();
        for activation in all {
            activation.begin_deactivation(reason);
        }
    }

    /// Membership hook: a silo vanished; nothing to keep for it here, the
    /// message center cancels its pending calls and the directory scrubs
    /// its entries.
    pub fn on_silo_status_change(&self, silo: &SiloAddress, terminating: bool) {
        if terminating {
            tracing::debug!(silo = %silo, "peer silo terminating");
        }
    }

    fn remove_record(&self, activation: &Rc<Activation>) {
        let mut activations = self.activations.borrow_mut();
        // Guard against removing a successor record for the same grain.
        if let Some(current) = activations.get(&activation.address.grain) {
            if Rc::ptr_eq(current, activation) {
                activations.remove(&activation.address.grain);
            }
        }
    }

    /// Reject work that queued behind an activation that failed to
    /// initialize; leaving it would strand callers until their deadlines.
    fn fail_pending(&self, activation: &Rc<Activation>, reason: &str) {
        activation.queue.close();
        let Ok(center) = self.center() else {
            return;
        };
        while let Some(item) = activation.queue.pop_startable(|_| true) {
            let rejection = Message::rejection(
                &item.message,
                crate::messaging::RejectionKind::Unrecoverable,
                format!("activation failed: {reason}"),
            );
            let center = center.clone();
            tokio::task::spawn_local(async move {
                if let Err(error) = center.transmit(rejection).await {
                    tracing::warn!(%error, "failed to reject pending item");
                }
            });
        }
    }

    /// Forward work that queued on an aborted (race-losing) slot to the
    /// winner.
    fn bounce_queue(&self, activation: &Rc<Activation>, winner: &GrainAddress) {
        activation.queue.close();
        let Ok(center) = self.center() else {
            return;
        };
        while let Some(item) = activation.queue.pop_startable(|_| true) {
            let mut message = item.message;
            message.target_silo = Some(winner.silo.clone());
            message.hop_count = message.hop_count.saturating_add(1);
            let center = center.clone();
            tokio::task::spawn_local(async move {
                if let Err(error) = center.transmit(message).await {
                    tracing::warn!(%error, "failed to bounce message to race winner");
                }
            });
        }
    }

    fn make_turn_runner(self: &Rc<Self>, activation: &Rc<Activation>) -> TurnRunner {
        let catalog = self.clone();
        let activation = activation.clone();
        Rc::new(move |item: WorkItem| {
            let catalog = catalog.clone();
            let activation = activation.clone();
            let turn: futures::future::LocalBoxFuture<'static, ()> = Box::pin(async move {
                let WorkItem { kind, message, .. } = item;
                let center = match catalog.center() {
                    Ok(center) => center,
                    Err(error) => {
                        tracing::error!(%error, "turn runner without message center");
                        return;
                    }
                };

                let ctx = GrainContext::new(
                    activation.address.clone(),
                    center.clone(),
                    catalog.config.clone(),
                    Some(activation.clone() as Rc<dyn crate::grain::ActivationControl>),
                );
                let outcome: Result<serde_json::Value, CallError> =
                    match activation.runtime().create_turn(&message, ctx) {
                        Ok(turn) => turn.await,
                        Err(error) => Err(error),
                    };

                catalog.working_set.observe_activity(&activation);

                match message.direction {
                    Direction::Request => {
                        let body = encode_turn_body(&outcome.map_err(|e| e.to_string()));
                        let response = Message::response(&message, body);
                        if let Err(error) = center.transmit(response).await {
                            tracing::warn!(
                                correlation = %message.correlation_id,
                                %error,
                                "failed to send response"
                            );
                        }
                    }
                    Direction::OneWay => {
                        if let Err(error) = outcome {
                            if kind == WorkItemKind::SystemPriority {
                                catalog.escalate_fatal(format!(
                                    "system work item failed on {}: {error}",
                                    activation.address
                                ));
                            } else {
                                tracing::warn!(
                                    activation = %activation.address,
                                    %error,
                                    "one-way turn failed"
                                );
                            }
                        }
                    }
                    Direction::Response | Direction::Rejection => {
                        // Responses complete callbacks in the message
                        // center; they never reach a turn runner.
                        tracing::error!(
                            direction = ?message.direction,
                            "response delivered to turn runner"
                        );
                    }
                }
            });
            turn
        })
    }

    fn make_drain_handler(self: &Rc<Self>) -> DrainHandler {
        let catalog = self.clone();
        Rc::new(move |activation: Rc<Activation>| {
            let catalog = catalog.clone();
            let teardown: futures::future::LocalBoxFuture<'static, ()> = Box::pin(async move {
                catalog.finish_deactivation(activation).await;
            });
            teardown
        })
    }

    async fn finish_deactivation(self: &Rc<Self>, activation: Rc<Activation>) {
        // Global shutdown can drain a pump while the record is still
        // Valid.
        if activation.state() == ActivationState::Valid {
            activation.begin_deactivation(DeactivationReason::SiloShutdown);
        }
        let reason = activation.deactivation_reason();
        self.working_set.observe_removed(&activation);

        if let Err(error) = activation.runtime().deactivate(reason).await {
            tracing::warn!(activation = %activation.address, %error, "on_deactivate failed");
        }

        if activation.grain_kind() == GrainKind::Stateful && !reason.is_abort() {
            if let Ok(directory) = self.directory() {
                if let Err(error) = directory
                    .unregister(
                        activation.address.clone(),
                        UnregistrationCause::DeactivationCompleted,
                    )
                    .await
                {
                    tracing::warn!(
                        activation = %activation.address,
                        %error,
                        "unregister on deactivation failed"
                    );
                }
            }
        }

        let _ = activation.try_transition(ActivationState::Invalid);
        self.remove_record(&activation);
        tracing::debug!(activation = %activation.address, ?reason, "activation removed");
    }

    fn escalate_fatal(&self, message: String) {
        tracing::error!(fatal = %message, "fatal error");
        if let Some(handler) = self.fatal_handler.borrow().clone() {
            handler(message);
        }
    }
}

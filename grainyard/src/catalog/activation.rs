//! Local activation records and the per-activation turn pump.

use crate::catalog::collector::CollectionTicket;
use crate::error::{CatalogError, SchedulerError};
use crate::grain::{ActivationControl, DeactivationReason, GrainKind, GrainRuntime};
use crate::scheduler::{ActivationQueue, SiloScheduler, WorkItem};
use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use grainyard_core::GrainAddress;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Activation lifecycle state machine.
///
/// ```text
/// Creating → Activating → Valid → Deactivating → Invalid
///     │           │
///     │           └────────────► Invalid   (on_activate failed)
///     └────────────────────────► Invalid   (lost the registration race)
/// ```
///
/// Transitions are one-way; an activation that left Valid never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationState {
    /// Slot reserved in the catalog; directory registration in flight.
    Creating,
    /// `on_activate` running.
    Activating,
    /// Serving calls.
    Valid,
    /// Draining; no new items accepted.
    Deactivating,
    /// Removed.
    Invalid,
}

impl ActivationState {
    /// Check whether a transition is legal.
    pub fn can_transition_to(&self, next: ActivationState) -> bool {
        use ActivationState::*;
        matches!(
            (self, next),
            (Creating, Activating)
                | (Creating, Invalid)
                | (Activating, Valid)
                | (Activating, Invalid)
                | (Valid, Deactivating)
                | (Deactivating, Invalid)
        )
    }
}

/// One in-memory incarnation of a grain on this silo.
///
/// Owns the grain instance (behind a type-erased [`GrainRuntime`]), the
/// two-lane work queue, and the bookkeeping the collector and scheduler
/// read: last activity, keep-alive, collection ticket, reentrancy.
pub struct Activation {
    pub address: GrainAddress,
    kind_name: String,
    grain_kind: GrainKind,
    reentrant: bool,
    age_limit: Duration,

    runtime: Rc<dyn GrainRuntime>,
    pub(crate) queue: ActivationQueue,

    state: Cell<ActivationState>,
    last_activity: Cell<Instant>,
    keep_alive_until: Cell<Option<Instant>>,
    ticket: Cell<Option<CollectionTicket>>,
    deactivate_when_idle: Cell<bool>,
    deactivation_reason: Cell<Option<DeactivationReason>>,

    inflight_turns: Cell<usize>,
    inflight_read_only: Cell<usize>,
}

impl Activation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        address: GrainAddress,
        kind_name: String,
        grain_kind: GrainKind,
        reentrant: bool,
        age_limit: Duration,
        runtime: Rc<dyn GrainRuntime>,
    ) -> Rc<Self> {
        Rc::new(Self {
            address,
            kind_name,
            grain_kind,
            reentrant,
            age_limit,
            runtime,
            queue: ActivationQueue::new(),
            state: Cell::new(ActivationState::Creating),
            last_activity: Cell::new(Instant::now()),
            keep_alive_until: Cell::new(None),
            ticket: Cell::new(None),
            deactivate_when_idle: Cell::new(false),
            deactivation_reason: Cell::new(None),
            inflight_turns: Cell::new(0),
            inflight_read_only: Cell::new(0),
        })
    }

    pub fn state(&self) -> ActivationState {
        self.state.get()
    }

    pub fn kind_name(&self) -> &str {
        &self.kind_name
    }

    pub fn grain_kind(&self) -> GrainKind {
        self.grain_kind
    }

    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    pub fn age_limit(&self) -> Duration {
        self.age_limit
    }

    pub fn runtime(&self) -> &Rc<dyn GrainRuntime> {
        &self.runtime
    }

    pub fn is_valid(&self) -> bool {
        self.state.get() == ActivationState::Valid
    }

    pub fn is_deactivating(&self) -> bool {
        matches!(
            self.state.get(),
            ActivationState::Deactivating | ActivationState::Invalid
        )
    }

    /// Attempt a lifecycle transition; fails on illegal edges.
    pub(crate) fn try_transition(&self, to: ActivationState) -> Result<(), CatalogError> {
        let from = self.state.get();
        if !from.can_transition_to(to) {
            return Err(CatalogError::InvalidStateTransition { from, to });
        }
        tracing::trace!(activation = %self.address, ?from, ?to, "state transition");
        self.state.set(to);
        Ok(())
    }

    /// Enqueue a work item, refusing once deactivation started.
    pub fn enqueue(&self, item: WorkItem) -> Result<(), SchedulerError> {
        if self.is_deactivating() {
            return Err(SchedulerError::QueueClosed);
        }
        self.queue.enqueue(item)
    }

    /// Record activity for the idle clock and lazily push the collection
    /// ticket out when it would fire within the age limit.
    pub fn note_activity(&self) {
        self.last_activity.set(Instant::now());
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity.get()
    }

    pub(crate) fn collection_ticket(&self) -> Option<CollectionTicket> {
        self.ticket.get()
    }

    pub(crate) fn set_collection_ticket(&self, ticket: Option<CollectionTicket>) {
        self.ticket.set(ticket);
    }

    /// Whether the sweep should hand this activation out for deactivation.
    pub(crate) fn should_collect(&self, now: Instant) -> bool {
        if self.inflight_turns.get() > 0 || !self.queue.is_empty() {
            return false;
        }
        if let Some(until) = self.keep_alive_until.get() {
            if until > now {
                return false;
            }
        }
        if self.deactivate_when_idle.get() {
            return true;
        }
        now.duration_since(self.last_activity.get()) >= self.age_limit
    }

    /// Begin draining: `Valid → Deactivating`, close the queue.
    ///
    /// Returns `false` when the activation already left Valid (a competing
    /// deactivation won).
    pub(crate) fn begin_deactivation(&self, reason: DeactivationReason) -> bool {
        if self.try_transition(ActivationState::Deactivating).is_err() {
            return false;
        }
        self.deactivation_reason.set(Some(reason));
        self.queue.close();
        true
    }

    pub(crate) fn deactivation_reason(&self) -> DeactivationReason {
        self.deactivation_reason
            .get()
            .unwrap_or(DeactivationReason::ExplicitRequest)
    }

    pub(crate) fn begin_turn(&self, read_only: bool) {
        self.inflight_turns.set(self.inflight_turns.get() + 1);
        if read_only {
            self.inflight_read_only
                .set(self.inflight_read_only.get() + 1);
        }
    }

    pub(crate) fn end_turn(&self, read_only: bool) {
        self.inflight_turns.set(self.inflight_turns.get() - 1);
        if read_only {
            self.inflight_read_only
                .set(self.inflight_read_only.get() - 1);
        }
        self.queue.poke();
    }

    pub fn inflight_turns(&self) -> usize {
        self.inflight_turns.get()
    }

    fn inflight_all_read_only(&self) -> bool {
        self.inflight_turns.get() == self.inflight_read_only.get()
    }

    /// The interleaving predicate, consulted on dequeue.
    ///
    /// With no turn in flight, anything may begin. Otherwise: reentrant
    /// activations interleave freely; `ALWAYS_INTERLEAVE` items interleave
    /// anywhere; read-only items interleave among read-only turns.
    pub(crate) fn may_start(&self, item: &WorkItem) -> bool {
        if self.inflight_turns.get() == 0 {
            return true;
        }
        if self.reentrant || item.always_interleaves() {
            return true;
        }
        item.is_read_only() && self.inflight_all_read_only()
    }
}

impl std::fmt::Debug for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("address", &self.address)
            .field("state", &self.state.get())
            .field("reentrant", &self.reentrant)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl ActivationControl for Activation {
    fn delay_deactivation(&self, period: Duration) {
        let until = Instant::now() + period;
        let current = self.keep_alive_until.get();
        if current.map(|c| until > c).unwrap_or(true) {
            self.keep_alive_until.set(Some(until));
        }
    }

    fn deactivate_on_idle(&self) {
        self.deactivate_when_idle.set(true);
    }

    fn enqueue_timer(&self, message: crate::messaging::Message) -> Result<(), SchedulerError> {
        self.enqueue(WorkItem::new(crate::scheduler::WorkItemKind::Timer, message))
    }
}

/// Runs one work item to completion, including response emission.
pub(crate) type TurnRunner = Rc<dyn Fn(WorkItem) -> LocalBoxFuture<'static, ()>>;

/// Runs the teardown path after the pump drained.
pub(crate) type DrainHandler = Rc<dyn Fn(Rc<Activation>) -> LocalBoxFuture<'static, ()>>;

/// The turn pump: drives an activation's queue until deactivation.
///
/// One pump task per activation, spawned when the activation becomes
/// Valid. Single cooperative loop:
///
/// 1. Pop the next startable item (system lane first, FIFO within lanes,
///    gated by the interleaving predicate) and start its turn.
/// 2. Poll in-flight turns; a non-reentrant activation has at most one.
/// 3. When deactivation begins, stop popping, drain in-flight turns and
///    the queue, then run the drain handler (teardown, unregistration).
///
/// The turn runner owns error capture: a failed turn becomes a failed
/// response (or a log line for one-way items) and never unwinds into this
/// loop.
pub(crate) async fn run_turn_pump(
    activation: Rc<Activation>,
    scheduler: Rc<SiloScheduler>,
    runner: TurnRunner,
    on_drained: DrainHandler,
) {
    let _guard = scheduler.register_pump();
    let mut inflight: FuturesUnordered<LocalBoxFuture<'static, ()>> = FuturesUnordered::new();
    let mut shutdown = scheduler.shutdown_signal();

    loop {
        // Application turns stopped: queued application items are dropped,
        // not drained; system items keep flowing.
        if scheduler.is_application_stopped() {
            let dropped = activation.queue.drain_application();
            if !dropped.is_empty() {
                tracing::debug!(
                    activation = %activation.address,
                    count = dropped.len(),
                    "dropping queued application items"
                );
            }
        }

        // Start every item the predicate admits right now, driving each
        // new turn to its first suspension before considering the next —
        // enqueue order is begin order.
        while let Some(item) = activation
            .queue
            .pop_startable(|item| activation.may_start(item))
        {
            if item.message.is_expired() {
                tracing::debug!(
                    activation = %activation.address,
                    correlation = %item.message.correlation_id,
                    "dropping expired work item"
                );
                continue;
            }
            let read_only = item.is_read_only();
            if !item
                .message
                .flags
                .contains(crate::messaging::MessageFlags::SUPPRESS_KEEP_ALIVE)
            {
                activation.note_activity();
            }
            activation.begin_turn(read_only);
            let turn = runner(item);
            let activation_for_turn = activation.clone();
            inflight.push(Box::pin(async move {
                turn.await;
                activation_for_turn.end_turn(read_only);
            }));
            drive_once(&mut inflight).await;
        }

        let draining = activation.is_deactivating() || *shutdown.borrow();
        if draining && inflight.is_empty() && activation.queue.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            Some(()) = inflight.next(), if !inflight.is_empty() => {}
            _ = activation.queue.wait() => {}
            _ = shutdown.changed() => {}
        }
    }

    on_drained(activation).await;
}

/// Poll the in-flight set once so a freshly-pushed turn reaches its first
/// suspension point (or completes) before anything else happens.
async fn drive_once(inflight: &mut FuturesUnordered<LocalBoxFuture<'static, ()>>) {
    futures::future::poll_fn(|cx| {
        use std::task::Poll;
        // A completed turn is consumed here; Pending just means every turn
        // is suspended, which is exactly what we wait for.
        let _ = std::pin::Pin::new(&mut *inflight).poll_next(cx);
        Poll::Ready(())
    })
    .await;
}

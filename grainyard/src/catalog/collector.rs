//! Idle-activation collection: a bucketed time wheel.

use crate::catalog::Activation;
use grainyard_core::GrainId;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A quantized deadline identifying one time-wheel bucket.
///
/// Tickets are quantum indexes counted from the collector's base instant,
/// so the deadline of a ticket is always an exact multiple of the quantum
/// and at least one quantum in the future at scheduling time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionTicket(u64);

impl fmt::Display for CollectionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick-{}", self.0)
    }
}

/// Bucketed time wheel expiring idle activations.
///
/// The wheel only decides *candidacy*: `scan_stale` re-checks every popped
/// activation under its record and either hands it back for deactivation
/// or reschedules it. The collector itself never deactivates.
///
/// # Invariants
///
/// - Each activation occupies at most one bucket at any moment
/// - A ticket cancels exactly once; `try_reschedule` fails when the ticket
///   already fired and the sweep will observe the fresh activity instead
/// - An activation whose last activity is within its age limit is never
///   returned for deactivation
pub struct ActivationCollector {
    quantum: Duration,
    base: Instant,
    buckets: RefCell<BTreeMap<CollectionTicket, HashMap<GrainId, Rc<Activation>>>>,
}

impl ActivationCollector {
    pub fn new(quantum: Duration) -> Self {
        Self {
            quantum: quantum.max(Duration::from_millis(1)),
            base: Instant::now(),
            buckets: RefCell::new(BTreeMap::new()),
        }
    }

    /// Ticket whose deadline covers `due`, never earlier than one quantum
    /// from now.
    fn ticket_for(&self, due: Instant) -> CollectionTicket {
        let now = Instant::now();
        let due = due.max(now + self.quantum);
        let offset = due.saturating_duration_since(self.base);
        let quantum_ms = self.quantum.as_millis().max(1) as u64;
        let offset_ms = offset.as_millis() as u64;
        CollectionTicket(offset_ms.div_ceil(quantum_ms))
    }

    /// Deadline a ticket fires at.
    fn deadline(&self, ticket: CollectionTicket) -> Instant {
        self.base + self.quantum * (ticket.0 as u32)
    }

    /// Insert an activation into the bucket covering `now + age_limit`.
    ///
    /// No-op when the activation already holds a ticket.
    pub fn schedule(&self, activation: &Rc<Activation>) {
        if activation.collection_ticket().is_some() {
            return;
        }
        let ticket = self.ticket_for(Instant::now() + activation.age_limit());
        self.buckets
            .borrow_mut()
            .entry(ticket)
            .or_default()
            .insert(activation.address.grain.clone(), activation.clone());
        activation.set_collection_ticket(Some(ticket));
        tracing::trace!(grain = %activation.address.grain, %ticket, "collection scheduled");
    }

    /// Remove the activation from its bucket, if the ticket has not fired.
    pub fn try_cancel(&self, activation: &Rc<Activation>) -> bool {
        let Some(ticket) = activation.collection_ticket() else {
            return false;
        };
        let mut buckets = self.buckets.borrow_mut();
        let Some(bucket) = buckets.get_mut(&ticket) else {
            // Bucket already popped by a sweep: the ticket fired.
            return false;
        };
        let removed = bucket.remove(&activation.address.grain).is_some();
        if removed {
            activation.set_collection_ticket(None);
            if bucket.is_empty() {
                buckets.remove(&ticket);
            }
        }
        removed
    }

    /// Move the activation to a later bucket on activity.
    ///
    /// Fails when the current ticket already fired; the in-flight sweep
    /// will observe the activation's recent activity and reschedule it
    /// itself.
    pub fn try_reschedule(&self, activation: &Rc<Activation>) -> bool {
        if !self.try_cancel(activation) {
            return false;
        }
        self.schedule(activation);
        true
    }

    /// Pop all due buckets and return the activations that should now be
    /// deactivated.
    ///
    /// For each popped activation, under its record: still Valid, idle past
    /// its age limit, nothing queued or running, and not kept alive —
    /// transition it to Deactivating and return it. Anything else is
    /// rescheduled (or dropped, when no longer Valid).
    pub fn scan_stale(&self) -> Vec<Rc<Activation>> {
        let now = Instant::now();
        let due: Vec<CollectionTicket> = {
            let buckets = self.buckets.borrow();
            buckets
                .keys()
                .copied()
                .take_while(|ticket| self.deadline(*ticket) <= now)
                .collect()
        };

        let mut collectable = Vec::new();
        for ticket in due {
            let Some(bucket) = self.buckets.borrow_mut().remove(&ticket) else {
                continue;
            };
            for (_, activation) in bucket {
                activation.set_collection_ticket(None);
                if !activation.is_valid() {
                    continue;
                }
                if activation.should_collect(now) {
                    if activation.begin_deactivation(crate::grain::DeactivationReason::IdleCollection)
                    {
                        tracing::debug!(
                            activation = %activation.address,
                            "idle activation collected"
                        );
                        collectable.push(activation);
                    }
                } else {
                    self.schedule(&activation);
                }
            }
        }
        collectable
    }

    /// Deadline of the activation's current ticket, if it holds one.
    pub(crate) fn deadline_of(&self, activation: &Rc<Activation>) -> Option<Instant> {
        activation.collection_ticket().map(|t| self.deadline(t))
    }

    /// Number of schedulable-for-collection activations across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.borrow().values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

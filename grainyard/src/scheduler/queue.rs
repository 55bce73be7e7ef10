//! Per-activation FIFO work-item queue with two priority lanes.

use crate::error::SchedulerError;
use crate::scheduler::{Lane, WorkItem};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use tokio::sync::Notify;

/// The work-item queue owned by one activation.
///
/// Two strict-FIFO lanes: system items dequeue before application items,
/// and the pump dequeues one item per turn-start decision. The queue itself
/// carries no execution logic; the activation's turn pump decides *when*
/// the next item may begin (non-reentrant: only between turns; reentrant:
/// whenever the interleaving predicate allows).
///
/// # Ordering guarantee
///
/// Two items enqueued in order `A, B` on the same lane are dequeued in
/// order `A, B`; B cannot begin before A has either completed or suspended,
/// because the pump pops B only after it started A's turn.
pub struct ActivationQueue {
    system: RefCell<VecDeque<WorkItem>>,
    application: RefCell<VecDeque<WorkItem>>,
    notify: Rc<Notify>,
    closed: Cell<bool>,
}

impl ActivationQueue {
    pub fn new() -> Self {
        Self {
            system: RefCell::new(VecDeque::new()),
            application: RefCell::new(VecDeque::new()),
            notify: Rc::new(Notify::new()),
            closed: Cell::new(false),
        }
    }

    /// Enqueue a work item on its lane.
    ///
    /// Fails definitely once the queue is closed (the activation is
    /// deactivating); already-queued items still drain.
    pub fn enqueue(&self, item: WorkItem) -> Result<(), SchedulerError> {
        if self.closed.get() {
            return Err(SchedulerError::QueueClosed);
        }
        match item.kind.lane() {
            Lane::System => self.system.borrow_mut().push_back(item),
            Lane::Application => self.application.borrow_mut().push_back(item),
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next item the pump may start, system lane first.
    ///
    /// `may_start` is the interleaving predicate: with turns in flight, a
    /// non-reentrant activation refuses everything, a reentrant one accepts
    /// anything, and flag-based policies fall in between. The head item is
    /// inspected but not skipped — FIFO order within a lane is preserved
    /// even when the head must wait.
    pub fn pop_startable(&self, may_start: impl Fn(&WorkItem) -> bool) -> Option<WorkItem> {
        for queue in [&self.system, &self.application] {
            let mut queue = queue.borrow_mut();
            if let Some(head) = queue.front() {
                if may_start(head) {
                    return queue.pop_front();
                }
            }
        }
        None
    }

    /// Wait until an enqueue or close happens.
    ///
    /// The pump re-checks its predicates after every wakeup; spurious
    /// wakeups are harmless.
    pub async fn wait(&self) {
        let notify = self.notify.clone();
        notify.notified().await;
    }

    /// Wake the pump without enqueueing (used when turns finish, so the
    /// pump re-evaluates its interleaving predicate).
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    /// Refuse new items; queued ones still drain.
    pub fn close(&self) {
        self.closed.set(true);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Number of queued items across both lanes.
    pub fn len(&self) -> usize {
        self.system.borrow().len() + self.application.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all queued application items, returning them for rejection.
    ///
    /// Used when the silo stops application turns.
    pub fn drain_application(&self) -> Vec<WorkItem> {
        self.application.borrow_mut().drain(..).collect()
    }
}

impl Default for ActivationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::WorkItemKind;
    use bytes::Bytes;
    use grainyard_core::{CorrelationId, GrainId, SiloAddress};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    fn item(kind: WorkItemKind, method: u32) -> WorkItem {
        let msg = crate::messaging::Message::request(
            CorrelationId::new(method as u64),
            SiloAddress::new(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000),
                1,
            ),
            GrainId::from_parts("test", "A", "a").unwrap(),
            GrainId::from_parts("test", "B", "b").unwrap(),
            1,
            method,
            Bytes::new(),
            Duration::from_secs(5),
        );
        WorkItem::new(kind, msg)
    }

    #[test]
    fn test_fifo_within_lane() {
        let queue = ActivationQueue::new();
        queue.enqueue(item(WorkItemKind::Invocation, 1)).unwrap();
        queue.enqueue(item(WorkItemKind::Invocation, 2)).unwrap();
        queue.enqueue(item(WorkItemKind::Invocation, 3)).unwrap();

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop_startable(|_| true))
            .map(|i| i.message.method_id)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_system_lane_dequeues_first() {
        let queue = ActivationQueue::new();
        queue.enqueue(item(WorkItemKind::Invocation, 1)).unwrap();
        queue.enqueue(item(WorkItemKind::SystemPriority, 2)).unwrap();

        let first = queue.pop_startable(|_| true).unwrap();
        assert_eq!(first.kind, WorkItemKind::SystemPriority);
    }

    #[test]
    fn test_predicate_blocks_head_without_skipping() {
        let queue = ActivationQueue::new();
        queue.enqueue(item(WorkItemKind::Invocation, 1)).unwrap();
        queue.enqueue(item(WorkItemKind::Invocation, 2)).unwrap();

        // Head refused: nothing comes out, and order is preserved.
        assert!(queue.pop_startable(|_| false).is_none());
        let head = queue.pop_startable(|_| true).unwrap();
        assert_eq!(head.message.method_id, 1);
    }

    #[test]
    fn test_closed_queue_rejects_new_items() {
        let queue = ActivationQueue::new();
        queue.enqueue(item(WorkItemKind::Invocation, 1)).unwrap();
        queue.close();

        assert!(matches!(
            queue.enqueue(item(WorkItemKind::Invocation, 2)),
            Err(SchedulerError::QueueClosed)
        ));
        // Queued item still drains.
        assert!(queue.pop_startable(|_| true).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_application_keeps_system() {
        let queue = ActivationQueue::new();
        queue.enqueue(item(WorkItemKind::Invocation, 1)).unwrap();
        queue.enqueue(item(WorkItemKind::SystemPriority, 2)).unwrap();

        let dropped = queue.drain_application();
        assert_eq!(dropped.len(), 1);
        assert_eq!(queue.len(), 1);
    }
}

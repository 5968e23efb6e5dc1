//! Per-destination queues
//!
//! Every destination owns one [`WorkQueue`] per message class and a single
//! [`ReadyQueue`]. A work queue holds the backlog that does not fit in the
//! class window; admission moves its oldest item to the ready queue, which
//! the dispatch loop drains one item per claim.
//!
//! Lock order, for every path that takes more than one of these:
//! work queues (ascending class index) -> ready queue -> dispatcher ring.

use crate::class::ClassId;
use crate::stats::{ClassDepth, QueueDepths};
use meshfs_common::NodeId;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One unit of outbound work
pub(crate) struct WorkItem<P> {
    pub(crate) class: ClassId,
    pub(crate) payload: P,
}

impl<P> WorkItem<P> {
    pub(crate) const fn new(class: ClassId, payload: P) -> Self {
        Self { class, payload }
    }
}

/// Backlog and in-flight accounting of one class at one destination
pub(crate) struct WorkQueue<P> {
    backlog: VecDeque<WorkItem<P>>,
    /// Admitted items (ready, sending, or awaiting completion)
    inflight: usize,
}

impl<P> WorkQueue<P> {
    const fn new() -> Self {
        Self {
            backlog: VecDeque::new(),
            inflight: 0,
        }
    }

    pub(crate) fn push(&mut self, item: WorkItem<P>) {
        self.backlog.push_back(item);
    }

    /// Take the oldest backlog item if the window has room for it
    pub(crate) fn admit_next(&mut self, window_size: usize) -> Option<WorkItem<P>> {
        if self.inflight >= window_size {
            return None;
        }
        let item = self.backlog.pop_front()?;
        self.inflight += 1;
        Some(item)
    }

    /// An admitted item left the queue set (sent or aborted)
    pub(crate) fn complete_one(&mut self) {
        debug_assert!(self.inflight > 0, "completion without admission");
        self.inflight = self.inflight.saturating_sub(1);
    }

    pub(crate) fn drain_backlog(&mut self) -> impl Iterator<Item = WorkItem<P>> + '_ {
        self.backlog.drain(..)
    }

    pub(crate) const fn inflight(&self) -> usize {
        self.inflight
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Items of every class that may be sent right now
pub(crate) struct ReadyQueue<P> {
    items: VecDeque<WorkItem<P>>,
}

impl<P> ReadyQueue<P> {
    const fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Append (or prepend, for priority classes); returns true if the queue
    /// was empty before
    pub(crate) fn push(&mut self, item: WorkItem<P>, priority: bool) -> bool {
        let was_empty = self.items.is_empty();
        if priority {
            self.items.push_front(item);
        } else {
            self.items.push_back(item);
        }
        was_empty
    }

    pub(crate) fn pop(&mut self) -> Option<WorkItem<P>> {
        self.items.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = WorkItem<P>> + '_ {
        self.items.drain(..)
    }
}

/// The queue set of one destination
pub(crate) struct DestinationQueues<P> {
    node: NodeId,
    workqs: Box<[Mutex<WorkQueue<P>>]>,
    ready: Mutex<ReadyQueue<P>>,
    /// A send to this destination is outstanding
    sending: AtomicBool,
    /// Destination was removed from the cluster
    removed: AtomicBool,
}

impl<P> DestinationQueues<P> {
    pub(crate) fn new(node: NodeId, num_classes: usize) -> Self {
        Self {
            node,
            workqs: (0..num_classes).map(|_| Mutex::new(WorkQueue::new())).collect(),
            ready: Mutex::new(ReadyQueue::new()),
            sending: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    pub(crate) const fn node(&self) -> NodeId {
        self.node
    }

    pub(crate) fn workq(&self, class: ClassId) -> &Mutex<WorkQueue<P>> {
        &self.workqs[class.index()]
    }

    /// Lock every work queue in class-index order
    pub(crate) fn lock_workqs(&self) -> Vec<MutexGuard<'_, WorkQueue<P>>> {
        self.workqs.iter().map(Mutex::lock).collect()
    }

    pub(crate) fn ready(&self) -> MutexGuard<'_, ReadyQueue<P>> {
        self.ready.lock()
    }

    /// Claim the destination for one send; false if a send is outstanding
    pub(crate) fn try_claim(&self) -> bool {
        self.sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.sending.store(false, Ordering::Release);
    }

    pub(crate) fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn depths(&self) -> QueueDepths {
        let workqs = self.lock_workqs();
        let ready = self.ready.lock();
        QueueDepths {
            classes: workqs
                .iter()
                .map(|wq| ClassDepth {
                    backlog: wq.backlog_len(),
                    inflight: wq.inflight(),
                })
                .collect(),
            ready: ready.len(),
            sending: self.is_sending(),
        }
    }
}

/// Caller-side reference to a destination registered with a send queue
pub struct DestinationHandle<P> {
    queues: Arc<DestinationQueues<P>>,
}

impl<P> DestinationHandle<P> {
    pub(crate) const fn new(queues: Arc<DestinationQueues<P>>) -> Self {
        Self { queues }
    }

    pub(crate) const fn queues(&self) -> &Arc<DestinationQueues<P>> {
        &self.queues
    }

    pub fn node(&self) -> NodeId {
        self.queues.node()
    }

    /// The destination was removed; enqueues through this handle fail
    pub fn is_removed(&self) -> bool {
        self.queues.is_removed()
    }
}

impl<P> Clone for DestinationHandle<P> {
    fn clone(&self) -> Self {
        Self {
            queues: Arc::clone(&self.queues),
        }
    }
}

impl<P> fmt::Debug for DestinationHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationHandle")
            .field("node", &self.queues.node())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(i: usize) -> ClassId {
        ClassId::from_index(i)
    }

    #[test]
    fn test_window_gates_admission() {
        let c = class(0);
        let mut wq = WorkQueue::new();
        for i in 0..5u32 {
            wq.push(WorkItem::new(c, i));
        }

        assert_eq!(wq.admit_next(2).unwrap().payload, 0);
        assert_eq!(wq.admit_next(2).unwrap().payload, 1);
        assert!(wq.admit_next(2).is_none());
        assert_eq!(wq.inflight(), 2);
        assert_eq!(wq.backlog_len(), 3);

        wq.complete_one();
        assert_eq!(wq.admit_next(2).unwrap().payload, 2);
        assert!(wq.admit_next(2).is_none());
    }

    #[test]
    fn test_ready_queue_priority_goes_first() {
        let c = class(0);
        let mut ready = ReadyQueue::new();
        assert!(ready.push(WorkItem::new(c, 1u32), false));
        assert!(!ready.push(WorkItem::new(c, 2), false));
        assert!(!ready.push(WorkItem::new(c, 3), true));

        let order: Vec<u32> = std::iter::from_fn(|| ready.pop().map(|i| i.payload)).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert!(ready.is_empty());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let dest = DestinationQueues::<u32>::new(NodeId::new(), 2);
        assert!(dest.try_claim());
        assert!(!dest.try_claim());
        assert!(dest.is_sending());
        dest.release();
        assert!(dest.try_claim());
    }

    #[test]
    fn test_depths_reports_every_class() {
        let c1 = class(1);
        let dest = DestinationQueues::<u32>::new(NodeId::new(), 2);
        dest.workq(c1).lock().push(WorkItem::new(c1, 7));

        let depths = dest.depths();
        assert_eq!(depths.classes.len(), 2);
        assert_eq!(depths.classes[1].backlog, 1);
        assert_eq!(depths.classes[0].backlog, 0);
        assert_eq!(depths.ready, 0);
        assert!(!depths.sending);
    }
}

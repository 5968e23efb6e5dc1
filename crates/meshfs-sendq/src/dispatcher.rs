//! Send queue dispatcher
//!
//! [`SendQueue`] ties the per-destination queues to one dispatch loop, a
//! bounded pool of send workers and the finalizer task:
//!
//! ```text
//! enqueue -> work queue -> (window) -> ready queue -> ring
//!         -> dispatch loop -> send worker -> reply -> completion -> finalizer
//! ```
//!
//! A destination is claimed only while a request is being written. Its
//! reply is awaited on a separate task, so up to a full window of requests
//! per class can be outstanding at one destination.
//!
//! Every accepted item is finalized exactly once. A destination going down
//! aborts what it has queued; only items of classes that are queueable when
//! down stay in their backlog until the destination comes back.

use crate::class::{ClassId, ClassTable, MessageClass, PendingReply};
use crate::error::{Outcome, Rejected, SendqError};
use crate::finalizer::{self, Completion, FinalizeQueue};
use crate::liveness::{Liveness, LivenessListener};
use crate::pool::{JobRunner, PoolSender, WorkerPool};
use crate::queue::{DestinationHandle, DestinationQueues, WorkItem, WorkQueue};
use crate::ring::Ring;
use crate::stats::{DispatchStats, QueueDepths, StatsSnapshot};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use meshfs_common::NodeId;
use meshfs_common::config::SendqConfig;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// How an enqueue to an unreachable destination is reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnqueueMode {
    /// The caller gets the error and its payload back
    #[default]
    Attached,
    /// The error goes to the class finalize callback, like any other
    /// completion; the caller only learns that the item was not queued
    Detached,
}

/// A claimed destination and the item popped from its ready queue
struct Job<P> {
    dest: Arc<DestinationQueues<P>>,
    item: WorkItem<P>,
}

struct Shared<P> {
    classes: Arc<ClassTable<P>>,
    liveness: Arc<dyn Liveness>,
    destinations: DashMap<NodeId, Arc<DestinationQueues<P>>>,
    ring: Mutex<Ring<P>>,
    /// Signalled on new ready work and on every finished send
    sendable: Notify,
    finalizeq: FinalizeQueue<P>,
    /// Tasks waiting for the replies of sent requests
    replies: Mutex<JoinSet<()>>,
    stats: Arc<DispatchStats>,
    shutting_down: AtomicBool,
}

struct Tasks {
    stop_tx: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    pool: WorkerPool,
    finalizer: JoinHandle<()>,
}

/// Outbound dispatch queue
pub struct SendQueue<P> {
    shared: Arc<Shared<P>>,
    tasks: Mutex<Option<Tasks>>,
}

impl<P: Send + Sync + 'static> SendQueue<P> {
    /// Start the dispatch loop, the send workers and the finalizer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        classes: ClassTable<P>,
        liveness: Arc<dyn Liveness>,
        config: &SendqConfig,
    ) -> Arc<Self> {
        let classes = Arc::new(classes);
        let stats = Arc::new(DispatchStats::new());
        let (finalizeq, finalize_rx) = FinalizeQueue::new(Arc::clone(&classes), Arc::clone(&stats));
        let finalizer = tokio::spawn(finalizer::run(
            finalize_rx,
            Arc::clone(&classes),
            Arc::clone(&stats),
        ));

        let shared = Arc::new(Shared {
            classes,
            liveness,
            destinations: DashMap::new(),
            ring: Mutex::new(Ring::new()),
            sendable: Notify::new(),
            finalizeq,
            replies: Mutex::new(JoinSet::new()),
            stats,
            shutting_down: AtomicBool::new(false),
        });

        let (jobs, pool) = WorkerPool::spawn(
            config.worker_threads,
            config.job_queue_length,
            Arc::clone(&shared),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&shared), jobs, stop_rx));

        info!(
            "send queue started: {} classes, {} workers, job queue {}",
            shared.classes.len(),
            pool.size(),
            config.job_queue_length
        );

        Arc::new(Self {
            shared,
            tasks: Mutex::new(Some(Tasks {
                stop_tx,
                dispatch,
                pool,
                finalizer,
            })),
        })
    }

    /// Get the queue set of `node`, creating it on first use
    pub fn register_destination(&self, node: NodeId) -> DestinationHandle<P> {
        let num_classes = self.shared.classes.len();
        let queues = Arc::clone(
            self.shared
                .destinations
                .entry(node)
                .or_insert_with(|| {
                    debug!("new destination {}", node);
                    Arc::new(DestinationQueues::new(node, num_classes))
                })
                .value(),
        );
        DestinationHandle::new(queues)
    }

    /// Look up a registered destination
    pub fn destination(&self, node: &NodeId) -> Option<DestinationHandle<P>> {
        self.shared
            .destinations
            .get(node)
            .map(|d| DestinationHandle::new(Arc::clone(d.value())))
    }

    pub fn destinations(&self) -> Vec<NodeId> {
        self.shared.destinations.iter().map(|d| *d.key()).collect()
    }

    pub fn classes(&self) -> &ClassTable<P> {
        &self.shared.classes
    }

    /// Queue `payload` for `dest`; never blocks.
    ///
    /// On success the class finalize callback will be called exactly once
    /// for this payload. On failure the payload is returned in [`Rejected`],
    /// except for unreachable destinations in [`EnqueueMode::Detached`],
    /// where it has been handed to the finalize callback instead.
    pub fn enqueue(
        &self,
        dest: &DestinationHandle<P>,
        class: ClassId,
        payload: P,
        mode: EnqueueMode,
    ) -> Result<(), Rejected<P>> {
        let shared = &self.shared;
        let Some(msg_class) = shared.classes.get(class) else {
            shared.stats.record_rejected();
            return Err(Rejected::new(
                SendqError::UnknownClass(class.index()),
                Some(payload),
            ));
        };
        let queues = dest.queues();
        let node = queues.node();

        let mut workq = queues.workq(class).lock();
        if shared.shutting_down.load(Ordering::Acquire) {
            drop(workq);
            shared.stats.record_rejected();
            return Err(Rejected::new(SendqError::Shutdown, Some(payload)));
        }

        let removed = queues.is_removed();
        let reachable = !removed && shared.liveness.is_reachable(&node);
        if !reachable && (removed || !msg_class.is_queueable_when_down()) {
            drop(workq);
            shared.stats.record_rejected();
            debug!("{} to {} refused: destination unreachable", msg_class.name(), node);
            return Err(match mode {
                EnqueueMode::Attached => {
                    Rejected::new(SendqError::Unreachable(node), Some(payload))
                }
                EnqueueMode::Detached => {
                    shared.finalizeq.push(Completion {
                        node,
                        item: WorkItem::new(class, payload),
                        result: Err(SendqError::Unreachable(node)),
                    });
                    Rejected::new(SendqError::Unreachable(node), None)
                }
            });
        }

        workq.push(WorkItem::new(class, payload));
        shared.stats.record_enqueued();
        trace!("{} to {} queued", msg_class.name(), node);
        if reachable {
            shared.admit(queues, msg_class, &mut workq);
        }
        Ok(())
    }

    /// Abort everything queued for `node` except the backlog of classes that
    /// are queueable when down
    pub fn host_became_unreachable(&self, node: &NodeId) {
        let Some(dest) = self.shared.lookup(node) else {
            return;
        };
        let aborted = self.shared.drain(&dest, false);
        info!("{} unreachable: aborted {} queued items", node, aborted);
    }

    /// Resume admission for every class of `node`
    pub fn host_became_reachable(&self, node: &NodeId) {
        let Some(dest) = self.shared.lookup(node) else {
            return;
        };
        if !self.shared.is_sendable(&dest) {
            return;
        }
        for (id, class) in self.shared.classes.iter() {
            let mut workq = dest.workq(id).lock();
            self.shared.admit(&dest, class, &mut workq);
        }
        info!("{} reachable: admission resumed", node);
    }

    /// Forget `node`, aborting all of its queued work; false if unknown
    pub fn remove_destination(&self, node: &NodeId) -> bool {
        let Some((_, dest)) = self.shared.destinations.remove(node) else {
            return false;
        };
        dest.mark_removed();
        let aborted = self.shared.drain(&dest, true);
        info!("{} removed: aborted {} queued items", node, aborted);
        true
    }

    /// True once [`Self::shutdown`] has begun; enqueues are refused
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Whether `node` is in the dispatch ring (has ready work)
    pub fn has_ready_work(&self, node: &NodeId) -> bool {
        self.shared.ring.lock().contains(node)
    }

    /// Number of destinations in the dispatch ring
    pub fn ready_destinations(&self) -> usize {
        self.shared.ring.lock().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn queue_depths(&self, node: &NodeId) -> Option<QueueDepths> {
        self.shared.lookup(node).map(|d| d.depths())
    }

    /// Stop dispatching, let the workers and pending replies finish, abort
    /// everything still queued and wait for the finalizer to deliver it
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            return;
        };
        info!("send queue shutting down");

        let _ = tasks.stop_tx.send(true);
        if let Err(e) = tasks.dispatch.await {
            error!("dispatch loop failed: {}", e);
        }
        tasks.pool.join().await;
        let mut replies = std::mem::take(&mut *self.shared.replies.lock());
        while let Some(joined) = replies.join_next().await {
            if let Err(e) = joined {
                error!("reply task failed: {}", e);
            }
        }

        let dests: Vec<_> = self
            .shared
            .destinations
            .iter()
            .map(|d| Arc::clone(d.value()))
            .collect();
        let aborted: usize = dests.iter().map(|d| self.shared.drain(d, true)).sum();

        self.shared.finalizeq.stop();
        if let Err(e) = tasks.finalizer.await {
            error!("finalizer failed: {}", e);
        }
        info!("send queue stopped: aborted {} queued items", aborted);
    }
}

impl<P: Send + Sync + 'static> LivenessListener for SendQueue<P> {
    fn became_reachable(&self, node: &NodeId) {
        self.host_became_reachable(node);
    }

    fn became_unreachable(&self, node: &NodeId) {
        self.host_became_unreachable(node);
    }
}

impl<P> Shared<P> {
    fn lookup(&self, node: &NodeId) -> Option<Arc<DestinationQueues<P>>> {
        self.destinations.get(node).map(|d| Arc::clone(d.value()))
    }

    fn is_sendable(&self, dest: &DestinationQueues<P>) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
            && !dest.is_removed()
            && self.liveness.is_reachable(&dest.node())
    }

    /// Move backlog items into the ready queue while the window allows
    fn admit(
        &self,
        dest: &Arc<DestinationQueues<P>>,
        class: &MessageClass<P>,
        workq: &mut WorkQueue<P>,
    ) {
        while let Some(item) = workq.admit_next(class.window_size()) {
            self.push_ready(dest, item, class.is_priority());
        }
    }

    fn push_ready(&self, dest: &Arc<DestinationQueues<P>>, item: WorkItem<P>, priority: bool) {
        let mut ready = dest.ready();
        if ready.push(item, priority) {
            self.ring.lock().insert(dest);
            drop(ready);
            self.sendable.notify_one();
        }
    }

    /// Pop the head of a claimed destination's ready queue, leaving the ring
    /// once the queue is empty
    fn pop_ready(&self, dest: &DestinationQueues<P>) -> Option<WorkItem<P>> {
        let mut ready = dest.ready();
        let item = ready.pop();
        if ready.is_empty() {
            self.ring.lock().remove(&dest.node());
        }
        item
    }

    /// An admitted item is done: free its window slot and finalize it
    fn complete(&self, dest: &Arc<DestinationQueues<P>>, item: WorkItem<P>, result: Outcome) {
        if let Some(class) = self.classes.get(item.class) {
            let mut workq = dest.workq(item.class).lock();
            workq.complete_one();
            if self.is_sendable(dest) {
                self.admit(dest, class, &mut workq);
            }
        }
        self.finalizeq.push(Completion {
            node: dest.node(),
            item,
            result,
        });
    }

    /// Abort the ready queue and the backlog of every class that is not
    /// queueable when down (of every class, if `abort_tolerant`)
    fn drain(&self, dest: &Arc<DestinationQueues<P>>, abort_tolerant: bool) -> usize {
        let node = dest.node();
        let mut aborted = Vec::new();
        {
            let mut workqs = dest.lock_workqs();
            let mut ready = dest.ready();
            self.ring.lock().remove(&node);

            for item in ready.drain() {
                workqs[item.class.index()].complete_one();
                aborted.push(item);
            }
            for (id, class) in self.classes.iter() {
                if abort_tolerant || !class.is_queueable_when_down() {
                    aborted.extend(workqs[id.index()].drain_backlog());
                }
            }
        }

        let count = aborted.len();
        for item in aborted {
            self.finalizeq.push(Completion {
                node,
                item,
                result: Err(SendqError::ConnectionAborted(node)),
            });
        }
        count
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> JobRunner<Job<P>> for Shared<P> {
    async fn run(self: Arc<Self>, job: Job<P>) {
        let Job { dest, item } = job;
        let node = dest.node();
        let class_id = item.class;
        let Some(class) = self.classes.get(class_id) else {
            self.complete(&dest, item, Err(SendqError::UnknownClass(class_id.index())));
            self.release(&dest);
            return;
        };
        let name = class.name();
        let sent = AssertUnwindSafe(class.handler().send(node, &item.payload))
            .catch_unwind()
            .await;
        match self.send_result(name, node, sent) {
            Ok(reply) => Arc::clone(&self).await_reply(Arc::clone(&dest), item, name, reply),
            Err(e) => self.complete(&dest, item, Err(e)),
        }
        // The request is out; the next item may go while the reply is pending.
        self.release(&dest);
    }
}

impl<P: Send + Sync + 'static> Shared<P> {
    fn release(&self, dest: &DestinationQueues<P>) {
        dest.release();
        self.sendable.notify_one();
    }

    /// Complete `item` once its reply resolves; the window slot stays taken
    /// until then
    fn await_reply(
        self: Arc<Self>,
        dest: Arc<DestinationQueues<P>>,
        item: WorkItem<P>,
        name: &'static str,
        reply: PendingReply,
    ) {
        let shared = Arc::clone(&self);
        let mut replies = self.replies.lock();
        while replies.try_join_next().is_some() {}
        replies.spawn(async move {
            let node = dest.node();
            let replied = AssertUnwindSafe(reply).catch_unwind().await;
            let result = shared.send_result(name, node, replied);
            shared.complete(&dest, item, result);
        });
    }

    /// Map a send or reply result, caught panics included, to an outcome
    fn send_result<T>(
        &self,
        name: &'static str,
        node: NodeId,
        result: std::thread::Result<meshfs_common::Result<T>>,
    ) -> Result<T, SendqError> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.stats.record_send_error();
                debug!("{} to {} failed: {}", name, node, e);
                Err(SendqError::Transport(e))
            }
            Err(_) => {
                self.stats.record_send_error();
                error!("send callback of class {} panicked", name);
                Err(SendqError::Transport(meshfs_common::Error::internal(
                    "send callback panicked",
                )))
            }
        }
    }
}

async fn dispatch_loop<P: Send + Sync + 'static>(
    shared: Arc<Shared<P>>,
    jobs: PoolSender<Job<P>>,
    mut stop: watch::Receiver<bool>,
) {
    debug!("dispatch loop running");
    loop {
        let claimed = shared.ring.lock().claim_next();
        let Some(dest) = claimed else {
            tokio::select! {
                () = shared.sendable.notified() => {}
                _ = stop.changed() => break,
            }
            continue;
        };

        let Some(item) = shared.pop_ready(&dest) else {
            dest.release();
            continue;
        };
        let node = dest.node();

        if !shared.is_sendable(&dest) {
            shared.complete(&dest, item, Err(SendqError::Unreachable(node)));
            dest.release();
            continue;
        }

        tokio::select! {
            permit = jobs.reserve() => {
                if let Some(permit) = permit {
                    shared.stats.record_dispatched();
                    trace!("dispatching to {}", node);
                    permit.send(Job { dest, item });
                } else {
                    warn!("send workers gone, aborting item for {}", node);
                    shared.complete(&dest, item, Err(SendqError::ConnectionAborted(node)));
                    dest.release();
                    break;
                }
            }
            _ = stop.changed() => {
                shared.complete(&dest, item, Err(SendqError::ConnectionAborted(node)));
                dest.release();
                break;
            }
        }
    }
    debug!("dispatch loop exiting");
}

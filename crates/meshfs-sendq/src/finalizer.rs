//! Finalize queue
//!
//! Completed items are handed to a single finalizer task which runs the
//! class finalize callback, keeping slow callbacks off the send workers and
//! the dispatch loop.

use crate::class::ClassTable;
use crate::error::{Outcome, SendqError};
use crate::queue::WorkItem;
use crate::stats::DispatchStats;
use meshfs_common::NodeId;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

/// A work item together with its result
pub(crate) struct Completion<P> {
    pub(crate) node: NodeId,
    pub(crate) item: WorkItem<P>,
    pub(crate) result: Outcome,
}

pub(crate) enum FinalizeMsg<P> {
    Complete(Completion<P>),
    Stop,
}

/// Producer side of the finalize queue
pub(crate) struct FinalizeQueue<P> {
    tx: mpsc::UnboundedSender<FinalizeMsg<P>>,
    classes: Arc<ClassTable<P>>,
    stats: Arc<DispatchStats>,
}

impl<P> FinalizeQueue<P> {
    pub(crate) fn new(
        classes: Arc<ClassTable<P>>,
        stats: Arc<DispatchStats>,
    ) -> (Self, mpsc::UnboundedReceiver<FinalizeMsg<P>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, classes, stats }, rx)
    }

    /// Queue a completion; never blocks
    pub(crate) fn push(&self, completion: Completion<P>) {
        match &completion.result {
            Err(SendqError::ConnectionAborted(_)) => self.stats.record_aborted(),
            Err(SendqError::Unreachable(_)) => self.stats.record_unreachable(),
            _ => {}
        }
        if let Err(mpsc::error::SendError(msg)) = self.tx.send(FinalizeMsg::Complete(completion)) {
            // finalizer already stopped: deliver on the caller
            if let FinalizeMsg::Complete(completion) = msg {
                warn!("finalizer stopped, finalizing {} inline", completion.node);
                deliver(&self.classes, &self.stats, completion);
            }
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(FinalizeMsg::Stop);
    }
}

/// Run the finalize callback of one completion
pub(crate) fn deliver<P>(
    classes: &ClassTable<P>,
    stats: &DispatchStats,
    completion: Completion<P>,
) {
    let Completion { node, item, result } = completion;
    let Some(class) = classes.get(item.class) else {
        error!("completion for unknown class {} dropped", item.class);
        return;
    };
    trace!("finalize {} to {}: {:?}", class.name(), node, result);
    stats.record_finalized();
    let handler = class.handler();
    if catch_unwind(AssertUnwindSafe(|| handler.finalize(node, item.payload, result))).is_err() {
        error!("finalize callback of class {} panicked", class.name());
    }
}

/// Finalizer task body: runs until `Stop`, then drains what is left
pub(crate) async fn run<P>(
    mut rx: mpsc::UnboundedReceiver<FinalizeMsg<P>>,
    classes: Arc<ClassTable<P>>,
    stats: Arc<DispatchStats>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            FinalizeMsg::Complete(completion) => deliver(&classes, &stats, completion),
            FinalizeMsg::Stop => break,
        }
    }

    // Anything pushed from now on is finalized by its producer.
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        if let FinalizeMsg::Complete(completion) = msg {
            deliver(&classes, &stats, completion);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassId, MessageClass, MessageHandler, PendingReply, replied};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u32, bool)>>,
    }

    #[async_trait]
    impl MessageHandler<u32> for Recorder {
        async fn send(
            &self,
            _node: NodeId,
            _payload: &u32,
        ) -> meshfs_common::Result<PendingReply> {
            Ok(replied(Ok(())))
        }

        fn finalize(&self, _node: NodeId, payload: u32, result: Outcome) {
            assert_ne!(payload, 99, "boom");
            self.seen.lock().push((payload, result.is_ok()));
        }
    }

    fn setup() -> (Arc<Recorder>, Arc<ClassTable<u32>>, ClassId) {
        let recorder = Arc::new(Recorder::default());
        let mut builder = ClassTable::<u32>::builder();
        let id = builder
            .register(MessageClass::new("test", 1, Arc::clone(&recorder) as Arc<dyn MessageHandler<u32>>))
            .unwrap();
        (recorder, Arc::new(builder.build()), id)
    }

    fn completion(id: ClassId, payload: u32, result: Outcome) -> Completion<u32> {
        Completion {
            node: NodeId::new(),
            item: WorkItem::new(id, payload),
            result,
        }
    }

    #[tokio::test]
    async fn test_finalizer_delivers_in_order_then_stops() {
        let (recorder, classes, id) = setup();
        let stats = Arc::new(DispatchStats::new());
        let (queue, rx) = FinalizeQueue::new(Arc::clone(&classes), Arc::clone(&stats));
        let task = tokio::spawn(run(rx, classes, Arc::clone(&stats)));

        let node = NodeId::new();
        queue.push(completion(id, 1, Ok(())));
        queue.push(completion(id, 2, Err(SendqError::ConnectionAborted(node))));
        queue.push(completion(id, 3, Err(SendqError::Unreachable(node))));
        queue.stop();
        task.await.unwrap();

        assert_eq!(*recorder.seen.lock(), vec![(1, true), (2, false), (3, false)]);
        let snap = stats.snapshot();
        assert_eq!(snap.finalized, 3);
        assert_eq!(snap.aborted, 1);
        assert_eq!(snap.unreachable, 1);
    }

    #[tokio::test]
    async fn test_push_after_stop_is_delivered_inline() {
        let (recorder, classes, id) = setup();
        let stats = Arc::new(DispatchStats::new());
        let (queue, rx) = FinalizeQueue::new(Arc::clone(&classes), Arc::clone(&stats));
        let task = tokio::spawn(run(rx, classes, Arc::clone(&stats)));
        queue.stop();
        task.await.unwrap();

        queue.push(completion(id, 7, Ok(())));
        assert_eq!(*recorder.seen.lock(), vec![(7, true)]);
    }

    #[tokio::test]
    async fn test_panicking_finalize_does_not_kill_finalizer() {
        let (recorder, classes, id) = setup();
        let stats = Arc::new(DispatchStats::new());
        let (queue, rx) = FinalizeQueue::new(Arc::clone(&classes), Arc::clone(&stats));
        let task = tokio::spawn(run(rx, classes, Arc::clone(&stats)));

        queue.push(completion(id, 99, Ok(())));
        queue.push(completion(id, 4, Ok(())));
        queue.stop();
        task.await.unwrap();

        assert_eq!(*recorder.seen.lock(), vec![(4, true)]);
    }
}

//! Shared fixtures for the send queue scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::FutureExt;
use meshfs_common::NodeId;
use meshfs_common::config::SendqConfig;
use meshfs_sendq::{
    ClassId, ClassTable, Liveness, LivenessTable, MessageClass, MessageHandler, Outcome,
    PendingReply, SendQueue, SendqError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, oneshot};

/// Payloads at or above this value fail with a transport error
pub const FAILING: u32 = 1000;

/// How an item was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    Sent,
    Failed,
    Aborted,
    Unreachable,
    Other,
}

impl Done {
    fn from_outcome(result: &Outcome) -> Self {
        match result {
            Ok(()) => Self::Sent,
            Err(SendqError::Transport(_)) => Self::Failed,
            Err(SendqError::ConnectionAborted(_)) => Self::Aborted,
            Err(SendqError::Unreachable(_)) => Self::Unreachable,
            Err(_) => Self::Other,
        }
    }
}

/// Replies held back until released, in the order their requests went out
struct ReplyGate {
    open: bool,
    credit: usize,
    waiting: VecDeque<oneshot::Sender<()>>,
}

impl ReplyGate {
    /// `None` if the reply may arrive right away
    fn wait(&mut self) -> Option<oneshot::Receiver<()>> {
        if self.open {
            return None;
        }
        if self.credit > 0 {
            self.credit -= 1;
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiting.push_back(tx);
        Some(rx)
    }

    fn release(&mut self, n: usize) {
        for _ in 0..n {
            match self.waiting.pop_front() {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => self.credit += 1,
            }
        }
    }
}

/// Handler recording every send and finalize. Writing a request waits on
/// `writes`; its reply waits until released.
pub struct Recorder {
    pub writes: Semaphore,
    replies: Mutex<ReplyGate>,
    pub sent: Mutex<Vec<(NodeId, u32)>>,
    pub done: Mutex<Vec<(NodeId, u32, Done)>>,
}

impl Recorder {
    fn new(writes_open: bool, replies_open: bool) -> Self {
        let permits = if writes_open { Semaphore::MAX_PERMITS } else { 0 };
        Self {
            writes: Semaphore::new(permits),
            replies: Mutex::new(ReplyGate {
                open: replies_open,
                credit: 0,
                waiting: VecDeque::new(),
            }),
            sent: Mutex::new(Vec::new()),
            done: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn done_count(&self) -> usize {
        self.done.lock().len()
    }

    /// Let `n` replies through, oldest request first
    pub fn release(&self, n: usize) {
        self.replies.lock().release(n);
    }

    /// Let `n` blocked writes through
    pub fn release_writes(&self, n: usize) {
        self.writes.add_permits(n);
    }

    pub fn done_for(&self, node: NodeId) -> Vec<(u32, Done)> {
        self.done
            .lock()
            .iter()
            .filter(|(n, _, _)| *n == node)
            .map(|(_, p, d)| (*p, *d))
            .collect()
    }
}

#[async_trait]
impl MessageHandler<u32> for Recorder {
    async fn send(&self, node: NodeId, payload: &u32) -> meshfs_common::Result<PendingReply> {
        if let Ok(permit) = self.writes.acquire().await {
            permit.forget();
        }
        self.sent.lock().push((node, *payload));
        if *payload >= FAILING {
            return Err(meshfs_common::Error::ConnectionFailed(format!("refused {payload}")));
        }
        let held = self.replies.lock().wait();
        Ok(async move {
            if let Some(rx) = held {
                let _ = rx.await;
            }
            Ok(())
        }
        .boxed())
    }

    fn finalize(&self, node: NodeId, payload: u32, result: Outcome) {
        self.done
            .lock()
            .push((node, payload, Done::from_outcome(&result)));
    }
}

/// Reachability as seen by the dispatcher: the liveness table, unless the
/// link has been cut behind its back
pub struct Link {
    table: Arc<LivenessTable>,
    cut: AtomicBool,
}

impl Link {
    /// Make every node unreachable without any liveness transition
    pub fn cut(&self) {
        self.cut.store(true, Ordering::SeqCst);
    }
}

impl Liveness for Link {
    fn is_reachable(&self, node: &NodeId) -> bool {
        !self.cut.load(Ordering::SeqCst) && self.table.is_reachable(node)
    }
}

pub struct Harness {
    pub sendq: Arc<SendQueue<u32>>,
    pub liveness: Arc<LivenessTable>,
    pub link: Arc<Link>,
    pub recorder: Arc<Recorder>,
    /// Not queueable when down
    pub strict: ClassId,
    /// Queueable when down
    pub tolerant: ClassId,
}

pub struct Setup {
    pub window: usize,
    pub workers: usize,
    pub job_queue_length: usize,
    pub writes_open: bool,
    pub replies_open: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            window: 2,
            workers: 4,
            job_queue_length: 16,
            writes_open: true,
            replies_open: true,
        }
    }
}

impl Setup {
    pub fn start(self) -> Harness {
        let recorder = Arc::new(Recorder::new(self.writes_open, self.replies_open));
        let mut builder = ClassTable::builder();
        let strict = builder
            .register(MessageClass::new(
                "strict",
                self.window,
                Arc::clone(&recorder) as Arc<dyn MessageHandler<u32>>,
            ))
            .unwrap();
        let tolerant = builder
            .register(
                MessageClass::new(
                    "tolerant",
                    self.window,
                    Arc::clone(&recorder) as Arc<dyn MessageHandler<u32>>,
                )
                .queueable_when_down(true),
            )
            .unwrap();

        let liveness = Arc::new(LivenessTable::new());
        let link = Arc::new(Link {
            table: Arc::clone(&liveness),
            cut: AtomicBool::new(false),
        });
        let config = SendqConfig {
            worker_threads: self.workers,
            job_queue_length: self.job_queue_length,
        };
        let sendq = SendQueue::start(
            builder.build(),
            Arc::clone(&link) as Arc<dyn Liveness>,
            &config,
        );
        liveness.add_listener(&sendq);

        Harness {
            sendq,
            liveness,
            link,
            recorder,
            strict,
            tolerant,
        }
    }
}

/// Poll `cond` until it holds; panics after five seconds
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Give the dispatcher a moment to do something it must not do
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

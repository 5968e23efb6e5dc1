//! Send worker pool
//!
//! A fixed number of workers pull jobs from one bounded queue. Submission
//! waits while the queue is full, which throttles the dispatch loop instead
//! of letting jobs pile up without bound.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Executes one job on a worker
#[async_trait]
pub(crate) trait JobRunner<J>: Send + Sync + 'static {
    async fn run(self: Arc<Self>, job: J);
}

/// Submission side of the pool; dropping it lets the workers drain and exit
pub(crate) struct PoolSender<J> {
    tx: mpsc::Sender<J>,
}

impl<J: Send> PoolSender<J> {
    /// Wait for a free slot in the job queue; `None` once the pool is gone
    pub(crate) async fn reserve(&self) -> Option<mpsc::Permit<'_, J>> {
        self.tx.reserve().await.ok()
    }
}

/// Worker tasks of the pool
pub(crate) struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of `queue_len` pending jobs
    pub(crate) fn spawn<J, R>(
        size: usize,
        queue_len: usize,
        runner: Arc<R>,
    ) -> (PoolSender<J>, Self)
    where
        J: Send + 'static,
        R: JobRunner<J>,
    {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        Arc::clone(&runner).run(job).await;
                    }
                    debug!("send worker {} exiting", worker);
                })
            })
            .collect();

        (PoolSender { tx }, Self { workers })
    }

    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to finish; the sender must be dropped first
    pub(crate) async fn join(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("send worker failed: {}", e);
            }
        }
    }
}

//! Back channel from the metadata server to storage nodes
//!
//! Three message classes share one send queue:
//!
//! - `status`: health probe, one outstanding per node, jumps the ready queue.
//!   A failed probe marks the node down.
//! - `fhremove`: remove a dead file replica. Kept queued while the node is
//!   down; a busy node gets the request again after `busy_retry_ms`.
//! - `replication_request`: ask a node to copy a replica from a source node.
//!
//! Reachability lives in a [`LivenessTable`]; the send queue listens to it,
//! and the heartbeat drives it from probe outcomes.

use crate::node::NodeDirectory;
use crate::transport::{HostStatus, Request, Transport};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashSet;
use futures::FutureExt;
use futures::future::join_all;
use meshfs_common::{Config, Error, FileRef, NodeId};
use meshfs_sendq::{
    ClassId, ClassTable, EnqueueMode, Liveness, LivenessTable, MessageClass, MessageHandler,
    Outcome, PendingReply, Rejected, SendQueue, SendqError, StatsSnapshot,
};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub const STATUS: &str = "status";
pub const FHREMOVE: &str = "fhremove";
pub const REPLICATION_REQUEST: &str = "replication_request";

/// Payload of every back channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Remove(FileRef),
    Replicate { source: NodeId, file: FileRef },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Remove(file) => write!(f, "fhremove {file}"),
            Self::Replicate { source, file } => write!(f, "replicate {file} from {source}"),
        }
    }
}

struct Inner {
    nodes: Arc<NodeDirectory>,
    liveness: Arc<LivenessTable>,
    transport: Arc<dyn Transport>,
    sendq: OnceLock<Weak<SendQueue<Command>>>,
    /// Nodes with a status probe queued or in flight
    awaiting_status: DashSet<NodeId>,
    busy_retry: Duration,
}

impl Inner {
    fn request(&self, command: &Command) -> meshfs_common::Result<Request> {
        Ok(match command {
            Command::Status => Request::Status,
            Command::Remove(file) => Request::FhRemove { file: *file },
            Command::Replicate { source, file } => Request::ReplicationRequest {
                source_address: self.nodes.address(source)?,
                file: *file,
            },
        })
    }

    /// Write the request for `command`; the reply is checked once it arrives
    async fn send(&self, node: NodeId, command: &Command) -> meshfs_common::Result<PendingReply> {
        let address = self.nodes.address(&node)?;
        let request = self.request(command)?;
        let reply = self.transport.send(&address, &request).await?;
        let nodes = Arc::clone(&self.nodes);
        Ok(async move {
            if let Some(status) = reply.await?.into_result()? {
                nodes.update_report(&node, status);
            }
            Ok(())
        }
        .boxed())
    }

    /// Queue `command` again once the retry delay has passed
    fn retry_later(&self, node: NodeId, class: &'static str, command: Command) {
        let Some(sendq) = self.sendq.get().cloned() else {
            return;
        };
        let delay = self.busy_retry;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(sendq) = sendq.upgrade() else {
                return;
            };
            let Some(dest) = sendq.destination(&node) else {
                return;
            };
            let Some(class_id) = sendq.classes().find(class) else {
                return;
            };
            if let Err(rejected) = sendq.enqueue(&dest, class_id, command, EnqueueMode::Detached) {
                debug!("retry of {} on {} not queued: {}", class, node, rejected);
            }
        });
    }
}

struct StatusProbe(Arc<Inner>);

#[async_trait]
impl MessageHandler<Command> for StatusProbe {
    async fn send(&self, node: NodeId, command: &Command) -> meshfs_common::Result<PendingReply> {
        self.0.send(node, command).await
    }

    fn finalize(&self, node: NodeId, _command: Command, result: Outcome) {
        self.0.awaiting_status.remove(&node);
        match result {
            Ok(()) => trace!("status of {} updated", node),
            Err(e) if e.is_host_down() => trace!("status probe of {} dropped: {}", node, e),
            Err(e) => {
                warn!("status probe of {} failed: {}", node, e);
                self.0.liveness.mark_down(node);
            }
        }
    }
}

struct FileRemoval(Arc<Inner>);

#[async_trait]
impl MessageHandler<Command> for FileRemoval {
    async fn send(&self, node: NodeId, command: &Command) -> meshfs_common::Result<PendingReply> {
        self.0.send(node, command).await
    }

    fn finalize(&self, node: NodeId, command: Command, result: Outcome) {
        match result {
            Ok(()) => debug!("{} on {} done", command, node),
            Err(SendqError::Transport(Error::Busy)) => {
                info!("{} on {}: busy, retrying later", command, node);
                self.0.retry_later(node, FHREMOVE, command);
            }
            Err(SendqError::Transport(Error::NoSuchObject { .. })) => {
                debug!("{} on {}: already gone", command, node);
            }
            Err(e) => warn!("{} on {} failed: {}", command, node, e),
        }
    }
}

struct ReplicationRequest(Arc<Inner>);

#[async_trait]
impl MessageHandler<Command> for ReplicationRequest {
    async fn send(&self, node: NodeId, command: &Command) -> meshfs_common::Result<PendingReply> {
        self.0.send(node, command).await
    }

    fn finalize(&self, node: NodeId, command: Command, result: Outcome) {
        match result {
            Ok(()) => info!("{} to {} accepted", command, node),
            Err(e) => warn!("{} to {} failed: {}", command, node, e),
        }
    }
}

/// Send queue and liveness tracking for all storage nodes
pub struct BackChannel {
    inner: Arc<Inner>,
    sendq: Arc<SendQueue<Command>>,
    status: ClassId,
    fhremove: ClassId,
    replication: ClassId,
}

impl BackChannel {
    /// Build the class table and start the send queue; every node starts down
    pub fn start(
        config: &Config,
        nodes: Arc<NodeDirectory>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let bc = &config.back_channel;
        let liveness = Arc::new(LivenessTable::new());
        let inner = Arc::new(Inner {
            nodes,
            liveness: Arc::clone(&liveness),
            transport,
            sendq: OnceLock::new(),
            awaiting_status: DashSet::new(),
            busy_retry: Duration::from_millis(bc.busy_retry_ms),
        });

        let mut classes = ClassTable::builder();
        let handler: Arc<dyn MessageHandler<Command>> = Arc::new(StatusProbe(Arc::clone(&inner)));
        let status =
            classes.register(MessageClass::new(STATUS, bc.status_window, handler).priority(true))?;
        let handler: Arc<dyn MessageHandler<Command>> = Arc::new(FileRemoval(Arc::clone(&inner)));
        let fhremove = classes.register(
            MessageClass::new(FHREMOVE, bc.remove_window, handler).queueable_when_down(true),
        )?;
        let handler: Arc<dyn MessageHandler<Command>> =
            Arc::new(ReplicationRequest(Arc::clone(&inner)));
        let replication = classes.register(MessageClass::new(
            REPLICATION_REQUEST,
            bc.replication_window,
            handler,
        ))?;

        let sendq = SendQueue::start(
            classes.build(),
            Arc::clone(&liveness) as Arc<dyn Liveness>,
            &config.sendq,
        );
        let _ = inner.sendq.set(Arc::downgrade(&sendq));
        liveness.add_listener(&sendq);
        for node in inner.nodes.ids() {
            sendq.register_destination(node);
        }
        info!("back channel started for {} storage nodes", inner.nodes.len());

        Ok(Self {
            inner,
            sendq,
            status,
            fhremove,
            replication,
        })
    }

    pub fn nodes(&self) -> &NodeDirectory {
        &self.inner.nodes
    }

    pub fn liveness(&self) -> &Arc<LivenessTable> {
        &self.inner.liveness
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.sendq.stats()
    }

    pub fn send_queue(&self) -> &Arc<SendQueue<Command>> {
        &self.sendq
    }

    /// Add a storage node; it stays down until a probe succeeds
    pub fn add_node(&self, name: &str, address: &str) -> NodeId {
        let id = NodeId::new();
        self.inner.nodes.insert(id, name, address);
        self.sendq.register_destination(id);
        info!("storage node {} ({}) added as {}", name, address, id);
        id
    }

    /// Drop a storage node; work still queued for it is aborted
    pub fn remove_node(&self, node: &NodeId) -> bool {
        let removed = self.sendq.remove_destination(node);
        self.inner.liveness.forget(node);
        self.inner.awaiting_status.remove(node);
        self.inner.nodes.remove(node).is_some() || removed
    }

    /// Remove a dead replica of `file` from `node`
    pub fn remove_file(&self, node: NodeId, file: FileRef) -> Result<(), Rejected<Command>> {
        self.enqueue(node, self.fhremove, Command::Remove(file))
    }

    /// Ask `dest` to copy `file` from `source`
    pub fn replicate(
        &self,
        dest: NodeId,
        source: NodeId,
        file: FileRef,
    ) -> Result<(), Rejected<Command>> {
        self.enqueue(dest, self.replication, Command::Replicate { source, file })
    }

    fn enqueue(
        &self,
        node: NodeId,
        class: ClassId,
        command: Command,
    ) -> Result<(), Rejected<Command>> {
        let dest = self.sendq.register_destination(node);
        self.sendq.enqueue(&dest, class, command, EnqueueMode::Attached)
    }

    /// Queue a status probe. A node that has not answered the previous probe
    /// by now is marked down instead.
    pub fn probe(&self, node: NodeId) {
        if !self.inner.awaiting_status.insert(node) {
            warn!("{}: no status reply since last heartbeat", node);
            self.inner.awaiting_status.remove(&node);
            self.inner.liveness.mark_down(node);
            return;
        }
        if let Err(rejected) = self.enqueue(node, self.status, Command::Status) {
            self.inner.awaiting_status.remove(&node);
            debug!("status probe of {} not queued: {}", node, rejected);
        }
    }

    /// Probe a down node directly, outside the send queue
    pub async fn reconnect(&self, node: NodeId) -> bool {
        match self.direct_status(node).await {
            Ok(report) => {
                if let Some(report) = report {
                    self.inner.nodes.update_report(&node, report);
                }
                self.inner.liveness.mark_up(node)
            }
            Err(e) => {
                trace!("{} still unreachable: {}", node, e);
                false
            }
        }
    }

    async fn direct_status(&self, node: NodeId) -> meshfs_common::Result<Option<HostStatus>> {
        let address = self.inner.nodes.address(&node)?;
        let reply = self.inner.transport.exchange(&address, &Request::Status).await?;
        reply.into_result()
    }

    /// One heartbeat round: probe reachable nodes through the send queue and
    /// try to reconnect the others
    pub async fn heartbeat(&self) {
        let mut down = Vec::new();
        for node in self.inner.nodes.ids() {
            if self.inner.liveness.is_reachable(&node) {
                self.probe(node);
            } else {
                down.push(node);
            }
        }
        join_all(down.into_iter().map(|node| self.reconnect(node))).await;
    }

    pub async fn shutdown(&self) {
        self.sendq.shutdown().await;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Scripted, wait_for};
    use super::*;
    use crate::transport::Reply;

    fn start(transport: Arc<Scripted>) -> (BackChannel, NodeId) {
        let mut config = Config::default();
        config.sendq.worker_threads = 2;
        config.back_channel.busy_retry_ms = 10;
        let nodes = Arc::new(NodeDirectory::new());
        let node = NodeId::new();
        nodes.insert(node, "osd-1", "osd-1:600");
        let bc = BackChannel::start(&config, nodes, transport).unwrap();
        (bc, node)
    }

    fn is_remove(r: &Request) -> bool {
        matches!(r, Request::FhRemove { .. })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnect_then_probe_updates_report() {
        let status = HostStatus {
            disk_avail: 42,
            ..Default::default()
        };
        let transport = Arc::new(Scripted::new(vec![], Reply::Status { status }));
        let (bc, node) = start(Arc::clone(&transport));
        assert!(!bc.liveness().is_reachable(&node));

        bc.heartbeat().await;
        assert!(bc.liveness().is_reachable(&node));
        assert_eq!(bc.nodes().get(&node).unwrap().report, Some(status));

        bc.heartbeat().await;
        wait_for(|| bc.stats().finalized == 1).await;
        assert_eq!(transport.count(|r| *r == Request::Status), 2);
        bc.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_probe_marks_node_down() {
        let transport = Arc::new(Scripted::new(
            vec![Reply::Ok],
            Reply::Error {
                message: "disk failure".to_string(),
            },
        ));
        let (bc, node) = start(Arc::clone(&transport));

        assert!(bc.reconnect(node).await);
        bc.probe(node);
        wait_for(|| !bc.liveness().is_reachable(&node)).await;
        bc.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_busy_removal_is_retried() {
        let transport = Arc::new(Scripted::new(vec![Reply::Ok, Reply::Busy], Reply::Ok));
        let (bc, node) = start(Arc::clone(&transport));
        assert!(bc.reconnect(node).await);

        bc.remove_file(node, FileRef::new(7, 1)).unwrap();
        wait_for(|| transport.count(is_remove) == 2).await;
        wait_for(|| bc.stats().finalized == 2).await;
        bc.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_removal_waits_for_node() {
        let transport = Arc::new(Scripted::new(vec![], Reply::Ok));
        let (bc, node) = start(Arc::clone(&transport));

        bc.remove_file(node, FileRef::new(7, 1)).unwrap();
        let err = bc
            .replicate(node, NodeId::new(), FileRef::new(7, 1))
            .unwrap_err();
        assert!(matches!(err.error, SendqError::Unreachable(_)));
        assert_eq!(transport.count(is_remove), 0);

        bc.heartbeat().await;
        wait_for(|| transport.count(is_remove) == 1).await;
        bc.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replication_names_source_address() {
        let transport = Arc::new(Scripted::new(vec![], Reply::Ok));
        let (bc, dest) = start(Arc::clone(&transport));
        let source = bc.add_node("osd-2", "osd-2:600");
        assert!(bc.reconnect(dest).await);

        bc.replicate(dest, source, FileRef::new(3, 9)).unwrap();
        wait_for(|| bc.stats().finalized == 1).await;
        let seen = transport.seen.lock();
        assert_eq!(
            seen.last().unwrap(),
            &(
                "osd-1:600".to_string(),
                Request::ReplicationRequest {
                    source_address: "osd-2:600".to_string(),
                    file: FileRef::new(3, 9),
                }
            )
        );
        drop(seen);
        bc.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_removal_does_not_delay_status() {
        let transport = Arc::new(
            Scripted::new(vec![], Reply::Ok).with_removal_delay(Duration::from_millis(500)),
        );
        let (bc, node) = start(Arc::clone(&transport));
        assert!(bc.reconnect(node).await);

        bc.remove_file(node, FileRef::new(5, 2)).unwrap();
        wait_for(|| transport.count(is_remove) == 1).await;
        for _ in 0..3 {
            bc.heartbeat().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(bc.liveness().is_reachable(&node));
        // one reconnect, then one queued status request per heartbeat
        assert_eq!(transport.count(|r| *r == Request::Status), 4);

        wait_for(|| bc.stats().finalized == 4).await;
        assert!(bc.liveness().is_reachable(&node));
        let stats = bc.stats();
        assert_eq!(stats.aborted, 0);
        assert_eq!(stats.send_errors, 0);
        bc.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_node_aborts_pending_removals() {
        let transport = Arc::new(Scripted::new(vec![], Reply::Ok));
        let (bc, node) = start(Arc::clone(&transport));

        bc.remove_file(node, FileRef::new(1, 1)).unwrap();
        assert!(bc.remove_node(&node));
        assert!(bc.nodes().is_empty());
        wait_for(|| bc.stats().aborted == 1).await;
        bc.shutdown().await;
    }
}

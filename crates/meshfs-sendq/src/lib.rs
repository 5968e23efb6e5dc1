//! meshfs Send Queue - outbound dispatch from the metadata server
//!
//! Every asynchronous request the metadata server sends to a storage node
//! (health probes, replica removal, replication commands) goes through a
//! [`SendQueue`]. The queue keeps one concurrency window per message class
//! and destination, interleaves destinations round-robin, and reports every
//! enqueued item exactly once through its class finalize callback, including
//! when the destination goes down while the item is queued.
//!
//! # Example
//! ```ignore
//! use meshfs_sendq::{ClassTable, EnqueueMode, LivenessTable, MessageClass, SendQueue};
//!
//! let mut classes = ClassTable::builder();
//! let status = classes.register(MessageClass::new("status", 1, handler).priority(true))?;
//! let liveness = Arc::new(LivenessTable::new());
//! let sendq = SendQueue::start(classes.build(), liveness.clone(), &config.sendq);
//! liveness.add_listener(&sendq);
//!
//! let dest = sendq.register_destination(node);
//! sendq.enqueue(&dest, status, probe, EnqueueMode::Attached)?;
//! ```

pub mod class;
pub mod dispatcher;
pub mod error;
mod finalizer;
pub mod liveness;
mod pool;
mod queue;
mod ring;
pub mod stats;

pub use class::{
    ClassId, ClassTable, ClassTableBuilder, MessageClass, MessageHandler, PendingReply, replied,
};
pub use dispatcher::{EnqueueMode, SendQueue};
pub use error::{Outcome, Rejected, SendqError, SendqResult};
pub use liveness::{Liveness, LivenessListener, LivenessTable};
pub use queue::DestinationHandle;
pub use stats::{ClassDepth, DispatchStats, QueueDepths, StatsSnapshot};

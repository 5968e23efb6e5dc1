//! Message classes
//!
//! A message class is a category of outbound work sharing one concurrency
//! window and one pair of callbacks. Classes are registered once at startup
//! into a [`ClassTable`] and never change afterwards.

use crate::error::{Outcome, SendqError, SendqResult};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use meshfs_common::NodeId;
use std::fmt;
use std::sync::Arc;

/// Reply of a request already written to its destination
pub type PendingReply = BoxFuture<'static, meshfs_common::Result<()>>;

/// A reply that is already known, for requests without one
pub fn replied(result: meshfs_common::Result<()>) -> PendingReply {
    futures::future::ready(result).boxed()
}

/// Callbacks supplied by the owner of a message class
#[async_trait]
pub trait MessageHandler<P>: Send + Sync {
    /// Write one request to `node` and return the future of its reply.
    ///
    /// Runs on a send worker while the destination is claimed; the claim is
    /// released as soon as this returns, and the item holds its window slot
    /// until the reply resolves. Errors from either step are delivered to
    /// [`Self::finalize`] unchanged; the queue never retries.
    async fn send(&self, node: NodeId, payload: &P) -> meshfs_common::Result<PendingReply>;

    /// Called exactly once per enqueued item, on the finalizer task.
    ///
    /// May enqueue new work (e.g. a retry); must not block for long, since
    /// completions for every destination are delivered from one task.
    fn finalize(&self, node: NodeId, payload: P, result: Outcome);
}

/// Dense index of a class in its table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(usize);

impl ClassId {
    #[cfg(test)]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static description of one category of outbound work
pub struct MessageClass<P> {
    name: &'static str,
    window_size: usize,
    queueable_when_down: bool,
    priority: bool,
    handler: Arc<dyn MessageHandler<P>>,
}

impl<P> MessageClass<P> {
    /// Create a class admitting at most `window_size` items per destination
    pub fn new(
        name: &'static str,
        window_size: usize,
        handler: Arc<dyn MessageHandler<P>>,
    ) -> Self {
        Self {
            name,
            window_size,
            queueable_when_down: false,
            priority: false,
            handler,
        }
    }

    /// Keep items of this class queued while the destination is down
    #[must_use]
    pub const fn queueable_when_down(mut self, yes: bool) -> Self {
        self.queueable_when_down = yes;
        self
    }

    /// Put admitted items at the head of the ready queue
    #[must_use]
    pub const fn priority(mut self, yes: bool) -> Self {
        self.priority = yes;
        self
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn window_size(&self) -> usize {
        self.window_size
    }

    pub const fn is_queueable_when_down(&self) -> bool {
        self.queueable_when_down
    }

    pub const fn is_priority(&self) -> bool {
        self.priority
    }

    pub(crate) fn handler(&self) -> &dyn MessageHandler<P> {
        self.handler.as_ref()
    }
}

impl<P> fmt::Debug for MessageClass<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageClass")
            .field("name", &self.name)
            .field("window_size", &self.window_size)
            .field("queueable_when_down", &self.queueable_when_down)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Immutable table of every class a send queue serves
pub struct ClassTable<P> {
    classes: Vec<MessageClass<P>>,
}

impl<P> ClassTable<P> {
    pub const fn builder() -> ClassTableBuilder<P> {
        ClassTableBuilder {
            classes: Vec::new(),
        }
    }

    pub fn get(&self, id: ClassId) -> Option<&MessageClass<P>> {
        self.classes.get(id.0)
    }

    /// Look a class up by name
    pub fn find(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(ClassId)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &MessageClass<P>)> {
        self.classes.iter().enumerate().map(|(i, c)| (ClassId(i), c))
    }
}

impl<P> fmt::Debug for ClassTable<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.classes).finish()
    }
}

/// Builder handing out [`ClassId`]s in registration order
pub struct ClassTableBuilder<P> {
    classes: Vec<MessageClass<P>>,
}

impl<P> ClassTableBuilder<P> {
    /// Register a class and return its id
    pub fn register(&mut self, class: MessageClass<P>) -> SendqResult<ClassId> {
        if class.window_size == 0 {
            return Err(SendqError::InvalidClass(format!(
                "{}: window size must be at least 1",
                class.name
            )));
        }
        if self.classes.iter().any(|c| c.name == class.name) {
            return Err(SendqError::InvalidClass(format!(
                "{}: registered twice",
                class.name
            )));
        }
        self.classes.push(class);
        Ok(ClassId(self.classes.len() - 1))
    }

    pub fn build(self) -> ClassTable<P> {
        ClassTable {
            classes: self.classes,
        }
    }
}

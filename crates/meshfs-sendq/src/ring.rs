//! Round-robin membership of destinations with ready work

use crate::queue::DestinationQueues;
use meshfs_common::NodeId;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Destinations whose ready queue is non-empty, in visiting order
pub(crate) struct Ring<P> {
    order: VecDeque<Arc<DestinationQueues<P>>>,
    members: HashSet<NodeId>,
}

impl<P> Ring<P> {
    pub(crate) fn new() -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Append at the tail unless already present
    pub(crate) fn insert(&mut self, dest: &Arc<DestinationQueues<P>>) -> bool {
        if !self.members.insert(dest.node()) {
            return false;
        }
        self.order.push_back(Arc::clone(dest));
        true
    }

    pub(crate) fn remove(&mut self, node: &NodeId) -> bool {
        if !self.members.remove(node) {
            return false;
        }
        self.order.retain(|d| d.node() != *node);
        true
    }

    pub(crate) fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Visit members starting after the last visited one and claim the first
    /// destination without an outstanding send. Every visited member rotates
    /// to the tail, so the next scan resumes behind the claimed one.
    pub(crate) fn claim_next(&mut self) -> Option<Arc<DestinationQueues<P>>> {
        for _ in 0..self.order.len() {
            let dest = self.order.pop_front()?;
            self.order.push_back(Arc::clone(&dest));
            if dest.try_claim() {
                return Some(dest);
            }
        }
        None
    }
}

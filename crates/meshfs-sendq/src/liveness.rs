//! Destination liveness
//!
//! The send queue asks a [`Liveness`] implementation whether a node is
//! reachable, and expects to be told about transitions through
//! [`LivenessListener`]. [`LivenessTable`] is an in-memory implementation of
//! both sides: callers report node status, and every registered listener is
//! notified synchronously when a node actually changes state.

use dashmap::DashMap;
use meshfs_common::{NodeId, NodeStatus};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::info;

/// Reachability oracle consulted by the send queue
///
/// `is_reachable` is called while send queue locks are held; it must not
/// wait on anything that invokes a [`LivenessListener`].
pub trait Liveness: Send + Sync {
    fn is_reachable(&self, node: &NodeId) -> bool;
}

/// Transition hooks, invoked synchronously by the liveness component
pub trait LivenessListener: Send + Sync {
    fn became_reachable(&self, node: &NodeId);
    fn became_unreachable(&self, node: &NodeId);
}

/// In-memory node status table with transition notification
#[derive(Default)]
pub struct LivenessTable {
    nodes: DashMap<NodeId, NodeStatus>,
    listeners: RwLock<Vec<Weak<dyn LivenessListener>>>,
    /// Serializes transitions so listeners see them in order
    transition: Mutex<()>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it is held weakly and dropped once released
    pub fn add_listener<L: LivenessListener + 'static>(&self, listener: &Arc<L>) {
        let weak: Weak<L> = Arc::downgrade(listener);
        self.listeners.write().push(weak);
    }

    /// Current status; unknown nodes are down
    pub fn status(&self, node: &NodeId) -> NodeStatus {
        self.nodes.get(node).map(|s| *s).unwrap_or_default()
    }

    /// Record a node's status; returns true if this was a transition
    pub fn set_status(&self, node: NodeId, status: NodeStatus) -> bool {
        let _guard = self.transition.lock();
        let previous = self.nodes.insert(node, status).unwrap_or_default();
        if previous == status {
            return false;
        }
        info!("node {} is now {:?}", node, status);

        let listeners: Vec<Arc<dyn LivenessListener>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            if status.is_up() {
                listener.became_reachable(&node);
            } else {
                listener.became_unreachable(&node);
            }
        }
        true
    }

    pub fn mark_up(&self, node: NodeId) -> bool {
        self.set_status(node, NodeStatus::Up)
    }

    pub fn mark_down(&self, node: NodeId) -> bool {
        self.set_status(node, NodeStatus::Down)
    }

    /// Forget a node; a node that was up is reported unreachable first
    pub fn forget(&self, node: &NodeId) {
        self.mark_down(*node);
        self.nodes.remove(node);
    }

    /// Nodes currently up
    pub fn up_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|e| e.value().is_up())
            .map(|e| *e.key())
            .collect()
    }
}

impl Liveness for LivenessTable {
    fn is_reachable(&self, node: &NodeId) -> bool {
        self.status(node).is_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Transitions {
        log: Mutex<Vec<(NodeId, bool)>>,
    }

    impl LivenessListener for Transitions {
        fn became_reachable(&self, node: &NodeId) {
            self.log.lock().push((*node, true));
        }

        fn became_unreachable(&self, node: &NodeId) {
            self.log.lock().push((*node, false));
        }
    }

    #[test]
    fn test_unknown_node_is_down() {
        let table = LivenessTable::new();
        assert!(!table.is_reachable(&NodeId::new()));
    }

    #[test]
    fn test_listener_sees_only_transitions() {
        let table = LivenessTable::new();
        let listener = Arc::new(Transitions::default());
        table.add_listener(&listener);

        let node = NodeId::new();
        assert!(table.mark_up(node));
        assert!(!table.mark_up(node));
        assert!(table.is_reachable(&node));
        assert!(table.mark_down(node));
        // first report of a node as down is not a transition
        assert!(!table.mark_down(NodeId::new()));

        assert_eq!(*listener.log.lock(), vec![(node, true), (node, false)]);
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let table = LivenessTable::new();
        let listener = Arc::new(Transitions::default());
        table.add_listener(&listener);
        drop(listener);

        table.mark_up(NodeId::new());
        assert!(table.listeners.read().is_empty());
    }

    #[test]
    fn test_forget_reports_down() {
        let table = LivenessTable::new();
        let listener = Arc::new(Transitions::default());
        table.add_listener(&listener);

        let node = NodeId::new();
        table.mark_up(node);
        table.forget(&node);

        assert_eq!(table.status(&node), NodeStatus::Down);
        assert!(table.up_nodes().is_empty());
        assert_eq!(listener.log.lock().len(), 2);
    }
}

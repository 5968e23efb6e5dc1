//! Storage node directory

use crate::transport::HostStatus;
use dashmap::DashMap;
use meshfs_common::config::NodeConfig;
use meshfs_common::{Error, NodeId, Result};

/// A storage node known to the metadata server
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub address: String,
    /// Last status report, if any probe succeeded
    pub report: Option<HostStatus>,
}

/// Address book of storage nodes
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: DashMap<NodeId, NodeInfo>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the directory from `[[nodes]]` entries
    pub fn from_config(entries: &[NodeConfig]) -> Result<Self> {
        let directory = Self::new();
        for entry in entries {
            let id = match &entry.id {
                Some(id) => NodeId::parse(id).ok_or_else(|| {
                    Error::configuration(format!("node {}: invalid id {}", entry.name, id))
                })?,
                None => NodeId::new(),
            };
            if directory.find(&entry.name).is_some() {
                return Err(Error::configuration(format!(
                    "node {} listed twice",
                    entry.name
                )));
            }
            directory.insert(id, &entry.name, &entry.address);
        }
        Ok(directory)
    }

    pub fn insert(&self, id: NodeId, name: &str, address: &str) {
        self.nodes.insert(
            id,
            NodeInfo {
                name: name.to_string(),
                address: address.to_string(),
                report: None,
            },
        );
    }

    pub fn remove(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.remove(id).map(|(_, info)| info)
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    pub fn address(&self, id: &NodeId) -> Result<String> {
        self.nodes
            .get(id)
            .map(|n| n.address.clone())
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| *n.key())
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| *n.key()).collect()
    }

    pub fn update_report(&self, id: &NodeId, report: HostStatus) {
        if let Some(mut node) = self.nodes.get_mut(id) {
            node.report = Some(report);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

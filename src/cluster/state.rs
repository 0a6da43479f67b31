//! Allocation table and the payloads of the cluster manager

use crate::entity::EntityError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type NodeId = u32;
pub type JobId = String;

/// Pool size when the input does not override it
pub const DEFAULT_NODE_COUNT: u32 = 25;

fn default_node_count() -> u32 {
    DEFAULT_NODE_COUNT
}

/// Occupancy of a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeSlot {
    Free,
    Assigned(JobId),
    /// Terminal; the node is never handed out again
    Unhealthy,
}

impl NodeSlot {
    pub fn is_free(&self) -> bool {
        matches!(self, NodeSlot::Free)
    }

    pub fn job(&self) -> Option<&str> {
        match self {
            NodeSlot::Assigned(job) => Some(job),
            _ => None,
        }
    }
}

/// Durable snapshot of the cluster manager
///
/// `nodes` is `Some` exactly when the cluster has been started. Its key set is
/// fixed at start and never changes afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterManagerState {
    pub cluster_started: bool,
    pub cluster_shutdown: bool,
    pub nodes: Option<BTreeMap<NodeId, NodeSlot>>,
    pub max_assigned_nodes: usize,
}

impl ClusterManagerState {
    /// Mark the cluster started with `node_count` free nodes
    ///
    /// Calling this again discards the existing table.
    pub fn start(&mut self, node_count: u32) {
        self.cluster_started = true;
        self.nodes = Some((0..node_count).map(|id| (id, NodeSlot::Free)).collect());
    }

    /// Free nodes in id order
    pub fn free_nodes(&self) -> Vec<NodeId> {
        self.iter_nodes()
            .filter(|(_, slot)| slot.is_free())
            .map(|(id, _)| id)
            .collect()
    }

    /// The `count` lowest-id free nodes, or the shortfall
    pub fn select_free_nodes(&self, count: usize) -> Result<Vec<NodeId>, EntityError> {
        let free = self.free_nodes();
        if free.len() < count {
            return Err(EntityError::InsufficientCapacity {
                requested: count,
                available: free.len(),
            });
        }
        Ok(free.into_iter().take(count).collect())
    }

    /// Nodes held by `job_id` in id order
    pub fn nodes_for_job(&self, job_id: &str) -> Vec<NodeId> {
        self.iter_nodes()
            .filter(|(_, slot)| slot.job() == Some(job_id))
            .map(|(id, _)| id)
            .collect()
    }

    /// Nodes holding any job, unhealthy nodes excluded
    pub fn assigned_nodes(&self) -> Vec<NodeId> {
        self.iter_nodes()
            .filter(|(_, slot)| slot.job().is_some())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn num_assigned_nodes(&self) -> usize {
        self.iter_nodes().filter(|(_, slot)| slot.job().is_some()).count()
    }

    /// Hand `node_ids` to `job_id` and refresh the high-water mark
    pub fn assign(&mut self, node_ids: &[NodeId], job_id: &str) {
        if let Some(nodes) = self.nodes.as_mut() {
            for id in node_ids {
                if let Some(slot) = nodes.get_mut(id) {
                    *slot = NodeSlot::Assigned(job_id.to_string());
                }
            }
        }
        self.refresh_peak();
    }

    /// Free `node_ids`, leaving nodes that were marked unhealthy in the meantime alone
    pub fn release(&mut self, node_ids: &[NodeId]) {
        if let Some(nodes) = self.nodes.as_mut() {
            for id in node_ids {
                if let Some(slot) = nodes.get_mut(id) {
                    if matches!(slot, NodeSlot::Assigned(_)) {
                        *slot = NodeSlot::Free;
                    }
                }
            }
        }
    }

    pub fn mark_unhealthy(&mut self, node_ids: impl IntoIterator<Item = NodeId>) {
        if let Some(nodes) = self.nodes.as_mut() {
            for id in node_ids {
                if let Some(slot) = nodes.get_mut(&id) {
                    *slot = NodeSlot::Unhealthy;
                }
            }
        }
    }

    pub fn unhealthy_nodes(&self) -> Vec<NodeId> {
        self.iter_nodes()
            .filter(|(_, slot)| matches!(slot, NodeSlot::Unhealthy))
            .map(|(id, _)| id)
            .collect()
    }

    fn refresh_peak(&mut self) {
        self.max_assigned_nodes = self.max_assigned_nodes.max(self.num_assigned_nodes());
    }

    fn iter_nodes(&self) -> impl Iterator<Item = (NodeId, &NodeSlot)> {
        self.nodes.iter().flat_map(|nodes| nodes.iter().map(|(id, slot)| (*id, slot)))
    }

    pub fn summary(&self) -> ClusterManagerResult {
        ClusterManagerResult {
            max_assigned_nodes: self.max_assigned_nodes,
            num_currently_assigned_nodes: self.num_assigned_nodes(),
        }
    }
}

/// Seed of a cluster manager run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterManagerInput {
    #[serde(default)]
    pub state: Option<ClusterManagerState>,
    #[serde(default)]
    pub test_continue_as_new: bool,
    #[serde(default = "default_node_count")]
    pub node_count: u32,
}

impl Default for ClusterManagerInput {
    fn default() -> Self {
        Self {
            state: None,
            test_continue_as_new: false,
            node_count: DEFAULT_NODE_COUNT,
        }
    }
}

impl ClusterManagerInput {
    pub fn with_test_continue_as_new(mut self, enabled: bool) -> Self {
        self.test_continue_as_new = enabled;
        self
    }

    pub fn with_node_count(mut self, node_count: u32) -> Self {
        self.node_count = node_count;
        self
    }

    pub fn with_state(mut self, state: ClusterManagerState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Final result of the cluster manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterManagerResult {
    pub max_assigned_nodes: usize,
    pub num_currently_assigned_nodes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateNNodesToJobInput {
    pub num_nodes: usize,
    pub job_name: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteJobInput {
    pub job_name: JobId,
}

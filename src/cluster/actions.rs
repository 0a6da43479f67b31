//! External resource actions invoked by the cluster manager

use crate::cluster::state::NodeId;
use crate::entity::ActionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use std::collections::BTreeSet;
use std::time::Duration;

pub const ALLOCATE_NODES_TO_JOB: &str = "allocate_nodes_to_job";
pub const DEALLOCATE_NODES_FOR_JOB: &str = "deallocate_nodes_for_job";
pub const FIND_BAD_NODES: &str = "find_bad_nodes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateNodesToJobInput {
    pub nodes: Vec<NodeId>,
    pub job_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeallocateNodesForJobInput {
    pub nodes: Vec<NodeId>,
    pub job_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindBadNodesInput {
    pub nodes_to_check: BTreeSet<NodeId>,
}

/// Remote operations against the node pool
///
/// Each call may be slow or fail; the caller decides the retry policy.
#[async_trait]
pub trait ResourceActions: Send + Sync {
    async fn allocate_nodes_to_job(&self, input: AllocateNodesToJobInput) -> Result<(), ActionError>;

    async fn deallocate_nodes_for_job(&self, input: DeallocateNodesForJobInput) -> Result<(), ActionError>;

    /// Subset of `nodes_to_check` that should be taken out of service
    async fn find_bad_nodes(&self, input: FindBadNodesInput) -> Result<BTreeSet<NodeId>, ActionError>;
}

/// In-process stand-in for a real resource manager
///
/// Every call takes `latency`; nodes whose id is a multiple of 5 report as bad.
pub struct SimulatedResourceActions {
    logger: Logger,
    latency: Duration,
}

impl SimulatedResourceActions {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            latency: Duration::from_millis(100),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn is_bad_node(node: NodeId) -> bool {
        node % 5 == 0
    }
}

#[async_trait]
impl ResourceActions for SimulatedResourceActions {
    async fn allocate_nodes_to_job(&self, input: AllocateNodesToJobInput) -> Result<(), ActionError> {
        info!(self.logger, "Assigning nodes to job";
            "nodes" => ?input.nodes,
            "job" => &input.job_name
        );
        tokio::time::sleep(self.latency).await;
        Ok(())
    }

    async fn deallocate_nodes_for_job(&self, input: DeallocateNodesForJobInput) -> Result<(), ActionError> {
        info!(self.logger, "Deallocating nodes from job";
            "nodes" => ?input.nodes,
            "job" => &input.job_name
        );
        tokio::time::sleep(self.latency).await;
        Ok(())
    }

    async fn find_bad_nodes(&self, input: FindBadNodesInput) -> Result<BTreeSet<NodeId>, ActionError> {
        tokio::time::sleep(self.latency).await;
        let bad_nodes: BTreeSet<NodeId> = input
            .nodes_to_check
            .into_iter()
            .filter(|node| Self::is_bad_node(*node))
            .collect();
        if bad_nodes.is_empty() {
            info!(self.logger, "No bad nodes found");
        } else {
            info!(self.logger, "Found bad nodes"; "nodes" => ?bad_nodes);
        }
        Ok(bad_nodes)
    }
}

//! Cluster manager entity
//!
//! A long-lived entity that assigns nodes from a fixed pool to jobs, takes
//! unhealthy nodes out of service and checkpoints its allocation table so it
//! can run indefinitely.

pub mod actions;
pub mod manager;
pub mod state;

pub use actions::{
    AllocateNodesToJobInput, DeallocateNodesForJobInput, FindBadNodesInput, ResourceActions,
    SimulatedResourceActions,
};
pub use manager::{
    CheckpointSettings, ClusterManager, ClusterQuery, ClusterQueryResult, ClusterSignal, ClusterUpdate,
    ClusterUpdateResult,
};
pub use state::{
    AllocateNNodesToJobInput, ClusterManagerInput, ClusterManagerResult, ClusterManagerState, DeleteJobInput,
    JobId, NodeId, NodeSlot, DEFAULT_NODE_COUNT,
};

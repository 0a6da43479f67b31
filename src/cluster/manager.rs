//! Cluster manager entity
//!
//! Owns a fixed pool of nodes and hands them out to jobs. Allocation, deletion
//! and the periodic health check each hold the nodes lock across their
//! resource action, so no two of them ever interleave on the allocation table.

use crate::cluster::actions::{
    AllocateNodesToJobInput, DeallocateNodesForJobInput, FindBadNodesInput, ResourceActions,
    ALLOCATE_NODES_TO_JOB, DEALLOCATE_NODES_FOR_JOB, FIND_BAD_NODES,
};
use crate::cluster::state::{
    AllocateNNodesToJobInput, ClusterManagerInput, ClusterManagerResult, ClusterManagerState, DeleteJobInput,
    NodeId,
};
use crate::entity::{
    ActionOptions, AtomicityLock, Entity, EntityContext, EntityError, RetryPolicy, RunOutcome,
};
use crate::runtime::EntityHandle;
use async_trait::async_trait;
use slog::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// When and how often the run loop considers checkpointing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSettings {
    /// Checkpoint once history grows past this length, on top of the runtime's suggestion
    pub history_ceiling: Option<u64>,
    /// Upper bound on the wait between two health checks
    pub loop_period: Duration,
}

impl CheckpointSettings {
    pub fn production() -> Self {
        Self {
            history_ceiling: None,
            loop_period: Duration::from_secs(600),
        }
    }

    /// Small thresholds so checkpoints happen within seconds
    pub fn test_mode() -> Self {
        Self {
            history_ceiling: Some(120),
            loop_period: Duration::from_secs(1),
        }
    }

    pub fn for_input(input: &ClusterManagerInput) -> Self {
        if input.test_continue_as_new {
            Self::test_mode()
        } else {
            Self::production()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterSignal {
    StartCluster,
    ShutdownCluster,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterUpdate {
    AllocateNNodesToJob(AllocateNNodesToJobInput),
    DeleteJob(DeleteJobInput),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterUpdateResult {
    Allocated(Vec<NodeId>),
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterQuery {
    State,
    AssignedNodes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterQueryResult {
    State(ClusterManagerState),
    AssignedNodes(Vec<NodeId>),
}

pub struct ClusterManager {
    ctx: EntityContext,
    actions: Arc<dyn ResourceActions>,
    state: Mutex<ClusterManagerState>,
    nodes_lock: AtomicityLock,
    node_count: u32,
    test_continue_as_new: bool,
    checkpoint: CheckpointSettings,
    action_options: ActionOptions,
    health_check_options: ActionOptions,
}

impl ClusterManager {
    fn state(&self) -> MutexGuard<'_, ClusterManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> ClusterManagerState {
        self.state().clone()
    }

    fn is_started(&self) -> bool {
        self.state().cluster_started
    }

    fn is_shutdown(&self) -> bool {
        self.state().cluster_shutdown
    }

    async fn start_cluster(&self) {
        let already_started = {
            let mut state = self.state();
            let already_started = state.cluster_started;
            state.start(self.node_count);
            already_started
        };
        if already_started {
            warn!(self.ctx.logger(), "Cluster started again; allocation table was reset";
                "node_count" => self.node_count
            );
        } else {
            info!(self.ctx.logger(), "Cluster started"; "node_count" => self.node_count);
        }
        self.ctx.notify_state_changed();
    }

    async fn shutdown_cluster(&self) {
        self.ctx.wait_condition(|| self.is_started()).await;
        self.state().cluster_shutdown = true;
        info!(self.ctx.logger(), "Cluster shut down");
        self.ctx.notify_state_changed();
    }

    /// Wait for the cluster to start, then refuse work once it is shutting down
    async fn admit(&self, operation: &str) -> Result<(), EntityError> {
        self.ctx.wait_condition(|| self.is_started()).await;
        if self.is_shutdown() {
            return Err(EntityError::rejected(format!(
                "Cannot {}: Cluster is already shut down",
                operation
            )));
        }
        Ok(())
    }

    async fn allocate_n_nodes_to_job(&self, input: AllocateNNodesToJobInput) -> Result<Vec<NodeId>, EntityError> {
        if input.num_nodes == 0 {
            return Err(EntityError::InvalidArgument(
                "num_nodes must be greater than zero".to_string(),
            ));
        }
        self.admit("allocate nodes to a job").await?;

        let _guard = self.nodes_lock.acquire().await;

        let selected = self.state().select_free_nodes(input.num_nodes)?;

        let payload = AllocateNodesToJobInput {
            nodes: selected.clone(),
            job_name: input.job_name.clone(),
        };
        self.ctx
            .execute_action(ALLOCATE_NODES_TO_JOB, &self.action_options, || {
                self.actions.allocate_nodes_to_job(payload.clone())
            })
            .await?;

        self.state().assign(&selected, &input.job_name);
        self.ctx.notify_state_changed();
        debug!(self.ctx.logger(), "Allocated nodes"; "job" => &input.job_name, "nodes" => ?selected);

        Ok(selected)
    }

    async fn delete_job(&self, input: DeleteJobInput) -> Result<(), EntityError> {
        self.admit("delete a job").await?;

        let _guard = self.nodes_lock.acquire().await;

        let nodes_to_free = self.state().nodes_for_job(&input.job_name);
        let payload = DeallocateNodesForJobInput {
            nodes: nodes_to_free.clone(),
            job_name: input.job_name.clone(),
        };
        self.ctx
            .execute_action(DEALLOCATE_NODES_FOR_JOB, &self.action_options, || {
                self.actions.deallocate_nodes_for_job(payload.clone())
            })
            .await?;

        self.state().release(&nodes_to_free);
        self.ctx.notify_state_changed();
        debug!(self.ctx.logger(), "Deleted job"; "job" => &input.job_name, "nodes" => ?nodes_to_free);

        Ok(())
    }

    /// Mark assigned nodes the resource manager reports as bad
    ///
    /// Best effort: a single attempt, failures are logged and dropped.
    async fn perform_health_checks(&self) {
        let _guard = self.nodes_lock.acquire().await;

        let nodes_to_check: BTreeSet<NodeId> = self.state().assigned_nodes().into_iter().collect();
        let outcome = self
            .ctx
            .execute_action(FIND_BAD_NODES, &self.health_check_options, || {
                self.actions.find_bad_nodes(FindBadNodesInput {
                    nodes_to_check: nodes_to_check.clone(),
                })
            })
            .await;

        match outcome {
            Ok(bad_nodes) if bad_nodes.is_empty() => {}
            Ok(bad_nodes) => {
                info!(self.ctx.logger(), "Marking nodes unhealthy"; "nodes" => ?bad_nodes);
                self.state().mark_unhealthy(bad_nodes);
                self.ctx.notify_state_changed();
            }
            Err(err) => {
                warn!(self.ctx.logger(), "Health check failed"; "error" => %err);
            }
        }
    }

    /// True when it is safe and worthwhile to restart from a snapshot
    pub fn should_continue_as_new(&self) -> bool {
        if self.nodes_lock.is_locked() || !self.ctx.all_handlers_finished() {
            return false;
        }
        let history = self.ctx.history();
        if history.continue_as_new_suggested {
            return true;
        }
        matches!(self.checkpoint.history_ceiling, Some(ceiling) if history.length > ceiling)
    }

    fn next_run_input(&self) -> ClusterManagerInput {
        ClusterManagerInput {
            state: Some(self.snapshot()),
            test_continue_as_new: self.test_continue_as_new,
            node_count: self.node_count,
        }
    }
}

#[async_trait]
impl Entity for ClusterManager {
    type Input = ClusterManagerInput;
    type Output = ClusterManagerResult;
    type Signal = ClusterSignal;
    type Update = ClusterUpdate;
    type UpdateResult = ClusterUpdateResult;
    type Query = ClusterQuery;
    type QueryResult = ClusterQueryResult;
    type Environment = Arc<dyn ResourceActions>;

    const ENTITY_TYPE: &'static str = "ClusterManager";

    fn create(input: ClusterManagerInput, ctx: EntityContext, actions: Arc<dyn ResourceActions>) -> Self {
        let checkpoint = CheckpointSettings::for_input(&input);
        let nodes_lock = AtomicityLock::new(ctx.notifier());
        let action_options = ActionOptions::default();
        let health_check_options = ActionOptions::default().with_retry_policy(RetryPolicy::no_retry());

        Self {
            ctx,
            actions,
            state: Mutex::new(input.state.unwrap_or_default()),
            nodes_lock,
            node_count: input.node_count,
            test_continue_as_new: input.test_continue_as_new,
            checkpoint,
            action_options,
            health_check_options,
        }
    }

    async fn handle_signal(&self, signal: ClusterSignal) {
        match signal {
            ClusterSignal::StartCluster => self.start_cluster().await,
            ClusterSignal::ShutdownCluster => self.shutdown_cluster().await,
        }
    }

    async fn handle_update(&self, update: ClusterUpdate) -> Result<ClusterUpdateResult, EntityError> {
        match update {
            ClusterUpdate::AllocateNNodesToJob(input) => self
                .allocate_n_nodes_to_job(input)
                .await
                .map(ClusterUpdateResult::Allocated),
            ClusterUpdate::DeleteJob(input) => self.delete_job(input).await.map(|()| ClusterUpdateResult::Deleted),
        }
    }

    fn handle_query(&self, query: ClusterQuery) -> ClusterQueryResult {
        match query {
            ClusterQuery::State => ClusterQueryResult::State(self.snapshot()),
            ClusterQuery::AssignedNodes => ClusterQueryResult::AssignedNodes(self.state().assigned_nodes()),
        }
    }

    async fn run(&self) -> Result<RunOutcome<ClusterManagerInput, ClusterManagerResult>, EntityError> {
        self.ctx.wait_condition(|| self.is_started()).await;

        loop {
            self.perform_health_checks().await;

            self.ctx
                .wait_condition_timeout(
                    || self.is_shutdown() || self.should_continue_as_new(),
                    self.checkpoint.loop_period,
                )
                .await;

            if self.is_shutdown() {
                break;
            }
            if self.should_continue_as_new() {
                let history = self.ctx.history();
                info!(self.ctx.logger(), "Checkpointing cluster state";
                    "history_length" => history.length,
                    "suggested" => history.continue_as_new_suggested
                );
                return Ok(RunOutcome::ContinueAsNew(self.next_run_input()));
            }
        }

        // Let updates that were admitted before shutdown finish
        self.ctx.wait_condition(|| self.ctx.all_handlers_finished()).await;

        let result = self.snapshot().summary();
        info!(self.ctx.logger(), "Cluster manager finished";
            "max_assigned_nodes" => result.max_assigned_nodes,
            "num_currently_assigned_nodes" => result.num_currently_assigned_nodes
        );
        Ok(RunOutcome::Completed(result))
    }
}

/// Typed calls against a running cluster manager
impl EntityHandle<ClusterManager> {
    pub async fn start_cluster(&self) -> Result<(), EntityError> {
        self.signal(ClusterSignal::StartCluster).await
    }

    pub async fn shutdown_cluster(&self) -> Result<(), EntityError> {
        self.signal(ClusterSignal::ShutdownCluster).await
    }

    pub async fn allocate_n_nodes_to_job(&self, num_nodes: usize, job_name: &str) -> Result<Vec<NodeId>, EntityError> {
        let update = ClusterUpdate::AllocateNNodesToJob(AllocateNNodesToJobInput {
            num_nodes,
            job_name: job_name.to_string(),
        });
        match self.execute_update(update).await? {
            ClusterUpdateResult::Allocated(nodes) => Ok(nodes),
            other => Err(EntityError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn delete_job(&self, job_name: &str) -> Result<(), EntityError> {
        let update = ClusterUpdate::DeleteJob(DeleteJobInput {
            job_name: job_name.to_string(),
        });
        match self.execute_update(update).await? {
            ClusterUpdateResult::Deleted => Ok(()),
            other => Err(EntityError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn cluster_state(&self) -> Result<ClusterManagerState, EntityError> {
        match self.query(ClusterQuery::State).await? {
            ClusterQueryResult::State(state) => Ok(state),
            other => Err(EntityError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn assigned_nodes(&self) -> Result<Vec<NodeId>, EntityError> {
        match self.query(ClusterQuery::AssignedNodes).await? {
            ClusterQueryResult::AssignedNodes(nodes) => Ok(nodes),
            other => Err(EntityError::UnexpectedReply(format!("{:?}", other))),
        }
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use cluster_entity::cluster::{
    AllocateNodesToJobInput, ClusterManager, ClusterManagerInput, DeallocateNodesForJobInput, FindBadNodesInput,
    NodeId, ResourceActions,
};
use cluster_entity::runtime::{EntityHandle, EntityRuntime, IdConflictPolicy};
use cluster_entity::{ActionError, RuntimeConfig};
use slog::{o, Drain, Logger};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

pub fn test_runtime(config: RuntimeConfig) -> EntityRuntime {
    EntityRuntime::new(config, test_logger())
}

/// One call made against [`ScriptedActions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionCall {
    Allocate { nodes: Vec<NodeId>, job: String },
    Deallocate { nodes: Vec<NodeId>, job: String },
    FindBadNodes(BTreeSet<NodeId>),
}

/// Resource actions double with scripted failures and call recording
///
/// Also tracks how many calls overlap, which must never exceed one while the
/// nodes lock is doing its job.
pub struct ScriptedActions {
    latency: Duration,
    health_check_latency: Duration,
    bad_nodes: BTreeSet<NodeId>,
    allocate_failure: Option<ActionError>,
    transient_allocate_failures: AtomicU32,
    fail_health_checks: bool,
    calls: Mutex<Vec<ActionCall>>,
    health_check_attempts: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedActions {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(100),
            health_check_latency: Duration::from_millis(100),
            bad_nodes: BTreeSet::new(),
            allocate_failure: None,
            transient_allocate_failures: AtomicU32::new(0),
            fail_health_checks: false,
            calls: Mutex::new(Vec::new()),
            health_check_attempts: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_bad_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.bad_nodes = nodes.into_iter().collect();
        self
    }

    pub fn with_health_check_latency(mut self, latency: Duration) -> Self {
        self.health_check_latency = latency;
        self
    }

    /// Every allocation attempt fails with `error`
    pub fn failing_allocations(mut self, error: ActionError) -> Self {
        self.allocate_failure = Some(error);
        self
    }

    /// The next `count` allocation attempts fail with a retryable error
    pub fn with_transient_allocate_failures(self, count: u32) -> Self {
        self.transient_allocate_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_health_checks(mut self) -> Self {
        self.fail_health_checks = true;
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<ActionCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn allocate_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ActionCall::Allocate { .. }))
            .count()
    }

    pub fn health_check_attempts(&self) -> u32 {
        self.health_check_attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: ActionCall, latency: Duration) {
        self.calls.lock().unwrap().push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceActions for ScriptedActions {
    async fn allocate_nodes_to_job(&self, input: AllocateNodesToJobInput) -> Result<(), ActionError> {
        self.enter(
            ActionCall::Allocate {
                nodes: input.nodes,
                job: input.job_name,
            },
            self.latency,
        )
        .await;

        if let Some(error) = &self.allocate_failure {
            return Err(error.clone());
        }
        let remaining = self.transient_allocate_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_allocate_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ActionError::retryable("resource manager unavailable"));
        }
        Ok(())
    }

    async fn deallocate_nodes_for_job(&self, input: DeallocateNodesForJobInput) -> Result<(), ActionError> {
        self.enter(
            ActionCall::Deallocate {
                nodes: input.nodes,
                job: input.job_name,
            },
            self.latency,
        )
        .await;
        Ok(())
    }

    async fn find_bad_nodes(&self, input: FindBadNodesInput) -> Result<BTreeSet<NodeId>, ActionError> {
        self.health_check_attempts.fetch_add(1, Ordering::SeqCst);
        let bad: BTreeSet<NodeId> = input.nodes_to_check.intersection(&self.bad_nodes).copied().collect();
        self.enter(ActionCall::FindBadNodes(input.nodes_to_check), self.health_check_latency)
            .await;

        if self.fail_health_checks {
            return Err(ActionError::retryable("health service unavailable"));
        }
        Ok(bad)
    }
}

/// Start a cluster manager backed by `actions` under a fresh id
pub fn start_cluster_manager(
    runtime: &EntityRuntime,
    entity_id: &str,
    actions: Arc<ScriptedActions>,
    input: ClusterManagerInput,
) -> EntityHandle<ClusterManager> {
    runtime
        .start_entity::<ClusterManager>(entity_id, input, actions, IdConflictPolicy::Fail)
        .expect("Should start cluster manager")
}

mod common;

use cluster_entity::cluster::{ClusterManagerInput, ClusterManagerResult};
use cluster_entity::{EntityError, EntityEvent, RuntimeConfig};
use common::{start_cluster_manager, test_runtime, ScriptedActions};
use futures::future::try_join_all;
use std::time::Duration;
use tokio::sync::broadcast;

fn continued_as_new(event: &EntityEvent) -> Option<u64> {
    match event {
        EntityEvent::ContinuedAsNew { history_length, .. } => Some(*history_length),
        _ => None,
    }
}

fn count_checkpoints(events: &mut broadcast::Receiver<EntityEvent>, entity_id: &str) -> usize {
    let mut count = 0;
    loop {
        match events.try_recv() {
            Ok(event) if event.entity_id() == entity_id && continued_as_new(&event).is_some() => count += 1,
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return count,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_preserves_state_in_test_mode() {
    let runtime = test_runtime(RuntimeConfig::default());
    let mut checkpoints = runtime.subscribe_entity("checkpointed");
    let handle = start_cluster_manager(
        &runtime,
        "checkpointed",
        ScriptedActions::new().into_shared(),
        ClusterManagerInput::default().with_test_continue_as_new(true),
    );

    handle.start_cluster().await.unwrap();
    let jobs: Vec<String> = (0..4).map(|i| format!("job-{}", i)).collect();
    try_join_all(jobs.iter().map(|job| handle.allocate_n_nodes_to_job(3, job)))
        .await
        .unwrap();
    handle.delete_job("job-0").await.unwrap();

    let before = handle.cluster_state().await.unwrap();
    assert_eq!(before.max_assigned_nodes, 12);
    assert_eq!(before.num_assigned_nodes(), 9);

    // Health checks alone grow the history past the test-mode ceiling
    let history_length = checkpoints
        .wait_for(continued_as_new, Some(Duration::from_secs(300)))
        .await
        .expect("Entity should continue as new");
    assert!(history_length > 120, "checkpointed at history length {}", history_length);

    let after = handle.cluster_state().await.unwrap();
    assert_eq!(after, before);
    assert!(after.cluster_started);
    assert!(!after.cluster_shutdown);

    // The new run keeps serving the same handle
    handle.allocate_n_nodes_to_job(2, "post-checkpoint").await.unwrap();
    for job in jobs.iter().skip(1) {
        handle.delete_job(job).await.unwrap();
    }
    handle.delete_job("post-checkpoint").await.unwrap();
    handle.shutdown_cluster().await.unwrap();

    assert_eq!(
        handle.result().await.unwrap(),
        ClusterManagerResult {
            max_assigned_nodes: 12,
            num_currently_assigned_nodes: 0,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_updates_survive_repeated_checkpoints() {
    // A tiny suggestion threshold makes the entity checkpoint every few updates
    let runtime = test_runtime(RuntimeConfig::default().with_continue_as_new_suggested_after(12));
    let mut events = runtime.subscribe_events();
    let actions = ScriptedActions::new().into_shared();
    let handle = start_cluster_manager(&runtime, "churn", actions.clone(), ClusterManagerInput::default());

    handle.start_cluster().await.unwrap();

    let jobs: Vec<String> = (0..12).map(|i| format!("job-{}", i)).collect();
    let allocations = try_join_all(jobs.iter().map(|job| handle.allocate_n_nodes_to_job(2, job)))
        .await
        .expect("Allocations should succeed across checkpoints");
    let mut all: Vec<_> = allocations.into_iter().flatten().collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 24);

    for job in &jobs {
        handle.delete_job(job).await.expect("Deletes should succeed across checkpoints");
    }

    let state = handle.cluster_state().await.unwrap();
    assert_eq!(state.num_assigned_nodes(), 0);
    assert_eq!(state.max_assigned_nodes, 24);

    handle.shutdown_cluster().await.unwrap();
    assert_eq!(
        handle.result().await.unwrap(),
        ClusterManagerResult {
            max_assigned_nodes: 24,
            num_currently_assigned_nodes: 0,
        }
    );

    assert!(count_checkpoints(&mut events, "churn") >= 2);
    assert_eq!(actions.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_allocation_issued_before_checkpoint_completes_after_it() {
    let runtime = test_runtime(RuntimeConfig::default().with_continue_as_new_suggested_after(8));
    let mut checkpoints = runtime.subscribe_entity("straddle");
    let handle = start_cluster_manager(
        &runtime,
        "straddle",
        ScriptedActions::new().into_shared(),
        ClusterManagerInput::default(),
    );

    handle.start_cluster().await.unwrap();
    handle.allocate_n_nodes_to_job(1, "warmup").await.unwrap();

    // The history is now past the threshold; the run checkpoints as soon as no
    // handler is in flight. Issue an allocation that races that checkpoint.
    let straddling = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.allocate_n_nodes_to_job(2, "straddling").await })
    };

    checkpoints
        .wait_for(continued_as_new, Some(Duration::from_secs(60)))
        .await
        .expect("Entity should continue as new");

    let nodes = straddling.await.unwrap().expect("Straddling allocation should succeed");
    assert_eq!(nodes, vec![1, 2]);

    let state = handle.cluster_state().await.unwrap();
    assert_eq!(state.nodes_for_job("warmup"), vec![0]);
    assert_eq!(state.nodes_for_job("straddling"), vec![1, 2]);
    assert_eq!(state.max_assigned_nodes, 3);
}

#[tokio::test(start_paused = true)]
async fn test_terminated_entity_reports_terminated() {
    let runtime = test_runtime(RuntimeConfig::default());
    let handle = start_cluster_manager(
        &runtime,
        "terminated",
        ScriptedActions::new().into_shared(),
        ClusterManagerInput::default().with_test_continue_as_new(true),
    );
    handle.start_cluster().await.unwrap();

    assert!(runtime.terminate("terminated"));
    assert!(matches!(handle.result().await, Err(EntityError::Terminated(_))));
}

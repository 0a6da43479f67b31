use clap::Parser;
use cluster_entity::cluster::{ClusterManager, ClusterManagerInput, ResourceActions, SimulatedResourceActions};
use cluster_entity::runtime::{EntityHandle, EntityRuntime, IdConflictPolicy};
use cluster_entity::{EntityError, EntityEvent, EntitySubscription, RuntimeConfig};
use futures::future::try_join_all;
use slog::{info, o, Drain, Logger};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "cluster-entity")]
#[command(about = "Drive a cluster manager entity through a full allocation lifecycle", long_about = None)]
struct Args {
    /// Use small checkpoint thresholds so the entity continues as new before shutting down
    #[arg(long, default_value_t = false)]
    test_continue_as_new: bool,

    /// Number of nodes in the pool
    #[arg(long, default_value_t = cluster_entity::cluster::DEFAULT_NODE_COUNT)]
    node_count: u32,

    /// Number of jobs allocated concurrently
    #[arg(long, default_value_t = 6)]
    allocations: usize,

    /// Nodes requested by each job
    #[arg(long, default_value_t = 2)]
    nodes_per_job: usize,
}

fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

async fn do_cluster_lifecycle(
    handle: &EntityHandle<ClusterManager>,
    args: &Args,
    mut checkpoints: EntitySubscription,
) -> Result<(), EntityError> {
    handle.start_cluster().await?;

    let jobs: Vec<String> = (0..args.allocations).map(|i| format!("task-{}", i)).collect();

    try_join_all(
        jobs.iter()
            .map(|job| handle.allocate_n_nodes_to_job(args.nodes_per_job, job)),
    )
    .await?;

    if args.test_continue_as_new {
        checkpoints
            .wait_for(
                |event| match event {
                    EntityEvent::ContinuedAsNew { run_id, .. } => Some(*run_id),
                    _ => None,
                },
                Some(Duration::from_secs(60)),
            )
            .await?;
    } else {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    try_join_all(jobs.iter().map(|job| handle.delete_job(job))).await?;

    handle.shutdown_cluster().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let logger = build_logger();

    let runtime = EntityRuntime::new(RuntimeConfig::default(), logger.clone());
    let actions: Arc<dyn ResourceActions> = Arc::new(SimulatedResourceActions::new(
        logger.new(o!("component" => "resource_actions")),
    ));

    let input = ClusterManagerInput::default()
        .with_test_continue_as_new(args.test_continue_as_new)
        .with_node_count(args.node_count);
    let entity_id = format!("ClusterManagerEntity-{}", Uuid::new_v4());
    let checkpoints = runtime.subscribe_entity(&entity_id);

    let handle = runtime.start_entity::<ClusterManager>(
        &entity_id,
        input,
        actions,
        IdConflictPolicy::TerminateExisting,
    )?;
    info!(logger, "Started cluster manager"; "entity_id" => &entity_id);

    do_cluster_lifecycle(&handle, &args, checkpoints).await?;

    let result = handle.result().await?;
    println!(
        "Cluster shut down successfully. It peaked at {} assigned nodes. It had {} nodes assigned at the end.",
        result.max_assigned_nodes, result.num_currently_assigned_nodes
    );

    runtime.shutdown();
    Ok(())
}

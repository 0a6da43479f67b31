pub mod cluster;
pub mod config;
pub mod entity;
pub mod event_bus;
pub mod runtime;

pub use cluster::{
    ClusterManager, ClusterManagerInput, ClusterManagerResult, ClusterManagerState, ResourceActions,
    SimulatedResourceActions,
};
pub use config::RuntimeConfig;
pub use entity::{
    ActionError, ActionOptions, AtomicityLock, Entity, EntityContext, EntityError, EntityEvent, RetryPolicy,
    RunOutcome,
};
pub use event_bus::{EntitySubscription, EventBus};
pub use runtime::{EntityHandle, EntityRuntime, IdConflictPolicy};

//! Entity abstraction
//!
//! An entity is a long-lived, single-instance state machine driven by signals
//! (fire-and-forget), updates (request/response) and read-only queries. The
//! hosting runtime polls the entity's run loop and all of its in-flight
//! handlers on one logical thread, so code between two `.await` points never
//! interleaves with another handler.

pub mod context;
pub mod error;
pub mod event;
pub mod history;
pub mod lock;
pub mod retry;

pub use context::{ChangeNotifier, EntityContext};
pub use error::{ActionError, EntityError};
pub use event::EntityEvent;
pub use history::{HistoryEventKind, HistoryInfo, HistoryTracker};
pub use lock::{AtomicityGuard, AtomicityLock};
pub use retry::{ActionOptions, RetryPolicy, DEFAULT_START_TO_CLOSE_TIMEOUT};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

/// How a run of an entity ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<I, O> {
    /// The entity finished and produced its final result
    Completed(O),
    /// Restart with a fresh history, seeded with this input
    ContinueAsNew(I),
}

/// A long-lived entity hosted by [`crate::runtime::EntityRuntime`]
///
/// Handlers take `&self`; any state they share must live behind interior
/// mutability and be reported through [`EntityContext::notify_state_changed`]
/// so pending waits re-evaluate.
#[async_trait]
pub trait Entity: Send + Sync + Sized + 'static {
    /// Seed passed to the first run and across every continue-as-new
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Final result of the entity
    type Output: Clone + Send + Sync + 'static;
    type Signal: Debug + Send + 'static;
    type Update: Debug + Send + 'static;
    type UpdateResult: Send + 'static;
    type Query: Debug + Send + 'static;
    type QueryResult: Send + 'static;
    /// Collaborators shared by every run (external actions, clients)
    type Environment: Clone + Send + Sync + 'static;

    /// Name used in logs and events
    const ENTITY_TYPE: &'static str;

    /// Build the entity for one run
    fn create(input: Self::Input, ctx: EntityContext, env: Self::Environment) -> Self;

    async fn handle_signal(&self, signal: Self::Signal);

    async fn handle_update(&self, update: Self::Update) -> Result<Self::UpdateResult, EntityError>;

    /// Answer a query from current state without mutating it
    fn handle_query(&self, query: Self::Query) -> Self::QueryResult;

    /// Main loop of one run
    async fn run(&self) -> Result<RunOutcome<Self::Input, Self::Output>, EntityError>;
}

//! Entity runtime
//!
//! Hosts long-lived entities in-process. Each logical entity owns a mailbox
//! that outlives individual runs, so a continue-as-new is invisible to anyone
//! holding an [`EntityHandle`]. A run and all of its in-flight handlers are
//! polled from a single task, giving the entity one logical thread of control
//! that only interleaves at `.await` points.

use crate::config::RuntimeConfig;
use crate::entity::{Entity, EntityContext, EntityError, EntityEvent, HistoryEventKind, RunOutcome};
use crate::event_bus::{EntitySubscription, EventBus};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use slog::{crit, debug, error, info, o, warn, Logger};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What to do when starting an entity whose id is already running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdConflictPolicy {
    /// Refuse to start a second instance
    #[default]
    Fail,
    /// Abort the running instance and replace it
    TerminateExisting,
}

enum Envelope<E: Entity> {
    Signal(E::Signal),
    Update(E::Update, oneshot::Sender<Result<E::UpdateResult, EntityError>>),
    Query(E::Query, oneshot::Sender<E::QueryResult>),
}

type Completion<E> = Option<Result<<E as Entity>::Output, EntityError>>;

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Client-side handle to a running entity
pub struct EntityHandle<E: Entity> {
    entity_id: String,
    mailbox: mpsc::Sender<Envelope<E>>,
    completion: watch::Receiver<Completion<E>>,
}

impl<E: Entity> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            entity_id: self.entity_id.clone(),
            mailbox: self.mailbox.clone(),
            completion: self.completion.clone(),
        }
    }
}

impl<E: Entity> std::fmt::Debug for EntityHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity_id", &self.entity_id)
            .field("entity_type", &E::ENTITY_TYPE)
            .finish()
    }
}

impl<E: Entity> EntityHandle<E> {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn closed(&self) -> EntityError {
        EntityError::Closed(self.entity_id.clone())
    }

    /// Deliver a fire-and-forget signal
    pub async fn signal(&self, signal: E::Signal) -> Result<(), EntityError> {
        self.mailbox
            .send(Envelope::Signal(signal))
            .await
            .map_err(|_| self.closed())
    }

    /// Deliver an update and wait for the handler's result
    pub async fn execute_update(&self, update: E::Update) -> Result<E::UpdateResult, EntityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.mailbox
            .send(Envelope::Update(update, reply_tx))
            .await
            .map_err(|_| self.closed())?;
        reply_rx.await.map_err(|_| self.closed())?
    }

    /// Read entity state without mutating it
    pub async fn query(&self, query: E::Query) -> Result<E::QueryResult, EntityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.mailbox
            .send(Envelope::Query(query, reply_tx))
            .await
            .map_err(|_| self.closed())?;
        reply_rx.await.map_err(|_| self.closed())
    }

    /// Wait for the entity's final result
    pub async fn result(&self) -> Result<E::Output, EntityError> {
        let mut completion = self.completion.clone();
        loop {
            let current = completion.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if completion.changed().await.is_err() {
                let last = completion.borrow().clone();
                return last.unwrap_or_else(|| Err(EntityError::Terminated(self.entity_id.clone())));
            }
        }
    }
}

struct RunningEntity {
    entity_type: &'static str,
    task: JoinHandle<()>,
}

/// In-process host for entities
pub struct EntityRuntime {
    config: RuntimeConfig,
    logger: Logger,
    event_bus: Arc<EventBus>,
    entities: Mutex<HashMap<String, RunningEntity>>,
}

impl EntityRuntime {
    pub fn new(config: RuntimeConfig, logger: Logger) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_bus_capacity));
        Self {
            config,
            logger,
            event_bus,
            entities: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EntityEvent> {
        self.event_bus.subscribe()
    }

    pub fn subscribe_entity(&self, entity_id: &str) -> EntitySubscription {
        self.event_bus.subscribe_entity(entity_id)
    }

    /// Start an entity under `entity_id`
    ///
    /// A finished entity's id can always be reused; a running one is handled
    /// according to `policy`.
    pub fn start_entity<E: Entity>(
        &self,
        entity_id: &str,
        input: E::Input,
        env: E::Environment,
        policy: IdConflictPolicy,
    ) -> Result<EntityHandle<E>, EntityError> {
        let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = entities.get(entity_id) {
            if !existing.task.is_finished() {
                match policy {
                    IdConflictPolicy::Fail => {
                        return Err(EntityError::AlreadyRunning(entity_id.to_string()));
                    }
                    IdConflictPolicy::TerminateExisting => {
                        warn!(self.logger, "Terminating running entity to reuse its id";
                            "entity_id" => entity_id,
                            "entity_type" => existing.entity_type
                        );
                        existing.task.abort();
                        self.event_bus.publish(EntityEvent::Terminated {
                            entity_id: entity_id.to_string(),
                        });
                    }
                }
            }
        }

        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.config.mailbox_capacity);
        let (completion_tx, completion_rx) = watch::channel(None);
        let logger = self.logger.new(o!(
            "entity_id" => entity_id.to_string(),
            "entity_type" => E::ENTITY_TYPE
        ));

        info!(logger, "Starting entity");

        let task = tokio::spawn(run_entity::<E>(
            entity_id.to_string(),
            input,
            env,
            mailbox_rx,
            completion_tx,
            self.config.clone(),
            logger,
            self.event_bus.clone(),
        ));

        entities.insert(
            entity_id.to_string(),
            RunningEntity {
                entity_type: E::ENTITY_TYPE,
                task,
            },
        );

        Ok(EntityHandle {
            entity_id: entity_id.to_string(),
            mailbox: mailbox_tx,
            completion: completion_rx,
        })
    }

    pub fn is_running(&self, entity_id: &str) -> bool {
        let entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        entities
            .get(entity_id)
            .map(|entity| !entity.task.is_finished())
            .unwrap_or(false)
    }

    /// Stop an entity without letting it finish; returns false if it was not running
    pub fn terminate(&self, entity_id: &str) -> bool {
        let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        match entities.remove(entity_id) {
            Some(entity) if !entity.task.is_finished() => {
                entity.task.abort();
                info!(self.logger, "Terminated entity"; "entity_id" => entity_id);
                self.event_bus.publish(EntityEvent::Terminated {
                    entity_id: entity_id.to_string(),
                });
                true
            }
            _ => false,
        }
    }

    /// Abort every running entity
    pub fn shutdown(&self) {
        let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        for (entity_id, entity) in entities.drain() {
            if !entity.task.is_finished() {
                entity.task.abort();
                self.event_bus.publish(EntityEvent::Terminated { entity_id });
            }
        }
        info!(self.logger, "Entity runtime shut down");
    }
}

/// Drive a logical entity across all of its runs
#[allow(clippy::too_many_arguments)]
async fn run_entity<E: Entity>(
    entity_id: String,
    input: E::Input,
    env: E::Environment,
    mut mailbox: mpsc::Receiver<Envelope<E>>,
    completion: watch::Sender<Completion<E>>,
    config: RuntimeConfig,
    logger: Logger,
    event_bus: Arc<EventBus>,
) {
    let mut input = input;
    let mut previous_run: Option<(Uuid, u64)> = None;

    loop {
        let run_id = Uuid::new_v4();
        let run_logger = logger.new(o!("run_id" => run_id.to_string()));
        let ctx = EntityContext::new(
            &entity_id,
            run_id,
            config.continue_as_new_suggested_after,
            run_logger.clone(),
        );

        match previous_run {
            None => event_bus.publish(EntityEvent::Started {
                entity_id: entity_id.clone(),
                entity_type: E::ENTITY_TYPE,
                run_id,
            }),
            Some((previous_run_id, history_length)) => event_bus.publish(EntityEvent::ContinuedAsNew {
                entity_id: entity_id.clone(),
                previous_run_id,
                run_id,
                history_length,
            }),
        };

        let entity = Arc::new(E::create(input, ctx.clone(), env.clone()));

        match drive_run(entity, &ctx, &mut mailbox).await {
            Ok(RunOutcome::ContinueAsNew(next)) => {
                let history_length = ctx.history().length;
                info!(run_logger, "Continuing as new"; "history_length" => history_length);
                match handoff::<E>(&next) {
                    Ok(seed) => {
                        input = seed;
                        previous_run = Some((run_id, history_length));
                    }
                    Err(err) => {
                        error!(run_logger, "Failed to hand off state"; "error" => %err);
                        completion.send_replace(Some(Err(err.clone())));
                        event_bus.publish(EntityEvent::Failed {
                            entity_id,
                            run_id,
                            error: err,
                        });
                        return;
                    }
                }
            }
            Ok(RunOutcome::Completed(output)) => {
                info!(run_logger, "Entity completed");
                completion.send_replace(Some(Ok(output)));
                event_bus.publish(EntityEvent::Completed { entity_id, run_id });
                return;
            }
            Err(err) => {
                error!(run_logger, "Entity failed"; "error" => %err);
                completion.send_replace(Some(Err(err.clone())));
                event_bus.publish(EntityEvent::Failed {
                    entity_id,
                    run_id,
                    error: err,
                });
                return;
            }
        }
    }
}

/// Carry the seed across the checkpoint boundary in serialized form
fn handoff<E: Entity>(input: &E::Input) -> Result<E::Input, EntityError> {
    let seed = serde_json::to_vec(input)?;
    Ok(serde_json::from_slice(&seed)?)
}

/// Poll one run and its handlers until the run returns
async fn drive_run<E: Entity>(
    entity: Arc<E>,
    ctx: &EntityContext,
    mailbox: &mut mpsc::Receiver<Envelope<E>>,
) -> Result<RunOutcome<E::Input, E::Output>, EntityError> {
    let run = {
        let entity = entity.clone();
        async move { entity.run().await }
    };
    tokio::pin!(run);

    let mut handlers: FuturesUnordered<HandlerFuture> = FuturesUnordered::new();
    let mut mailbox_open = true;

    loop {
        tokio::select! {
            biased;

            outcome = &mut run => {
                if !handlers.is_empty() {
                    warn!(ctx.logger(), "Run returned with handlers still in flight";
                        "handlers" => handlers.len()
                    );
                }
                return outcome;
            }

            Some(()) = handlers.next(), if !handlers.is_empty() => {}

            message = mailbox.recv(), if mailbox_open => match message {
                Some(envelope) => dispatch(&entity, ctx, envelope, &mut handlers),
                None => {
                    debug!(ctx.logger(), "All entity handles dropped");
                    mailbox_open = false;
                }
            },
        }
    }
}

fn dispatch<E: Entity>(
    entity: &Arc<E>,
    ctx: &EntityContext,
    envelope: Envelope<E>,
    handlers: &mut FuturesUnordered<HandlerFuture>,
) {
    match envelope {
        Envelope::Query(query, reply) => {
            let _ = reply.send(entity.handle_query(query));
        }
        Envelope::Signal(signal) => {
            ctx.record(HistoryEventKind::SignalReceived);
            debug!(ctx.logger(), "Dispatching signal"; "signal" => ?signal);
            ctx.handler_started();

            let entity = entity.clone();
            let ctx = ctx.clone();
            handlers.push(Box::pin(async move {
                if let Err(panic) = AssertUnwindSafe(entity.handle_signal(signal)).catch_unwind().await {
                    crit!(ctx.logger(), "Signal handler panicked"; "panic" => panic_message(&*panic));
                }
                ctx.handler_finished();
            }));
        }
        Envelope::Update(update, reply) => {
            ctx.record(HistoryEventKind::UpdateAccepted);
            debug!(ctx.logger(), "Dispatching update"; "update" => ?update);
            ctx.handler_started();

            let entity = entity.clone();
            let ctx = ctx.clone();
            handlers.push(Box::pin(async move {
                let result = match AssertUnwindSafe(entity.handle_update(update)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(&*panic);
                        crit!(ctx.logger(), "Update handler panicked"; "panic" => &message);
                        Err(EntityError::HandlerPanicked(message))
                    }
                };
                ctx.record(HistoryEventKind::UpdateCompleted);
                ctx.handler_finished();
                let _ = reply.send(result);
            }));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

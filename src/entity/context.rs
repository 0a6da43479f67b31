//! Entity execution context
//!
//! Provides the primitives an entity needs from its host: suspending until a
//! predicate over entity state holds, bounded waits, running external actions
//! under a retry policy, and access to the run's history.

use crate::entity::error::{ActionError, EntityError};
use crate::entity::history::{HistoryEventKind, HistoryInfo, HistoryTracker};
use crate::entity::retry::ActionOptions;
use slog::{debug, warn, Logger};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Wakes every pending `wait_condition` so it re-evaluates its predicate
#[derive(Clone, Debug)]
pub struct ChangeNotifier {
    tx: Arc<watch::Sender<u64>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Report that entity state changed
    pub fn notify(&self) {
        self.tx.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Receiver that has already seen the current version
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

struct ContextInner {
    entity_id: String,
    run_id: Uuid,
    logger: Logger,
    changes: ChangeNotifier,
    history: HistoryTracker,
    handlers_in_flight: AtomicUsize,
}

/// Context handed to an entity run
///
/// One context exists per run; a continue-as-new creates a fresh context with
/// a new run id and an empty history.
#[derive(Clone)]
pub struct EntityContext {
    inner: Arc<ContextInner>,
}

impl EntityContext {
    /// Create a context for one run of an entity
    pub fn new(entity_id: &str, run_id: Uuid, suggest_continue_as_new_after: u64, logger: Logger) -> Self {
        let history = HistoryTracker::new(suggest_continue_as_new_after);
        history.record(HistoryEventKind::EntityStarted);

        Self {
            inner: Arc::new(ContextInner {
                entity_id: entity_id.to_string(),
                run_id,
                logger,
                changes: ChangeNotifier::new(),
                history,
                handlers_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.inner.entity_id
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// Notifier shared by everything that mutates this run's state
    pub fn notifier(&self) -> ChangeNotifier {
        self.inner.changes.clone()
    }

    pub fn notify_state_changed(&self) {
        self.inner.changes.notify();
    }

    pub fn history(&self) -> HistoryInfo {
        self.inner.history.info()
    }

    pub(crate) fn record(&self, kind: HistoryEventKind) {
        self.inner.history.record(kind);
    }

    pub(crate) fn handler_started(&self) {
        self.inner.handlers_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn handler_finished(&self) {
        self.inner.handlers_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.notify_state_changed();
    }

    /// Number of signal and update handlers that have not finished
    pub fn handlers_in_flight(&self) -> usize {
        self.inner.handlers_in_flight.load(Ordering::SeqCst)
    }

    pub fn all_handlers_finished(&self) -> bool {
        self.handlers_in_flight() == 0
    }

    /// Suspend until `condition` returns true
    ///
    /// The predicate is re-evaluated after every state change notification.
    pub async fn wait_condition<F>(&self, condition: F)
    where
        F: Fn() -> bool,
    {
        let mut changes = self.inner.changes.subscribe();
        loop {
            if condition() {
                return;
            }
            if changes.changed().await.is_err() {
                // The sender lives as long as this context, so this is unreachable
                // in practice; park instead of spinning.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Suspend until `condition` holds or `timeout` elapses
    ///
    /// Returns true when the condition was met, false on timeout.
    pub async fn wait_condition_timeout<F>(&self, condition: F, timeout: Duration) -> bool
    where
        F: Fn() -> bool,
    {
        if condition() {
            return true;
        }

        self.record(HistoryEventKind::TimerStarted);
        let met = tokio::time::timeout(timeout, self.wait_condition(condition))
            .await
            .is_ok();
        if !met {
            self.record(HistoryEventKind::TimerFired);
        }
        met
    }

    /// Run an external action under a start-to-close timeout and retry policy
    ///
    /// `call` is invoked once per attempt. Retries are not visible in history;
    /// only the scheduling and the final outcome are recorded.
    pub async fn execute_action<T, F, Fut>(
        &self,
        action: &str,
        options: &ActionOptions,
        mut call: F,
    ) -> Result<T, EntityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActionError>>,
    {
        self.record(HistoryEventKind::ActionScheduled);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(self.logger(), "Executing action"; "action" => action, "attempt" => attempt);

            let outcome = match tokio::time::timeout(options.start_to_close_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ActionError::timed_out(options.start_to_close_timeout)),
            };

            match outcome {
                Ok(value) => {
                    self.record(HistoryEventKind::ActionCompleted);
                    return Ok(value);
                }
                Err(err) if err.non_retryable || !options.retry_policy.allows_attempt(attempt) => {
                    self.record(HistoryEventKind::ActionFailed);
                    return Err(EntityError::ActionFailed {
                        action: action.to_string(),
                        attempts: attempt,
                        message: err.message,
                    });
                }
                Err(err) => {
                    let delay = options.retry_policy.delay_after(attempt);
                    warn!(self.logger(), "Action attempt failed, retrying";
                        "action" => action,
                        "attempt" => attempt,
                        "delay" => ?delay,
                        "error" => %err
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for EntityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityContext")
            .field("entity_id", &self.inner.entity_id)
            .field("run_id", &self.inner.run_id)
            .field("history_length", &self.inner.history.length())
            .finish()
    }
}

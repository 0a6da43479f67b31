//! Event Bus
//!
//! Broadcasts entity lifecycle events to any number of observers. Publishing
//! never blocks the runtime; slow subscribers lose the oldest events.

use crate::entity::{EntityError, EntityEvent};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Broadcast channel for [`EntityEvent`]s
pub struct EventBus {
    tx: broadcast::Sender<EntityEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event, returning how many subscribers received it
    pub fn publish(&self, event: EntityEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Receive all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.tx.subscribe()
    }

    /// Receive future events for a single entity
    pub fn subscribe_entity(&self, entity_id: &str) -> EntitySubscription {
        EntitySubscription {
            receiver: self.tx.subscribe(),
            entity_id: entity_id.to_string(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Event stream filtered to one entity id
pub struct EntitySubscription {
    receiver: broadcast::Receiver<EntityEvent>,
    entity_id: String,
}

impl EntitySubscription {
    /// Wait for the first event of this entity that `extract` maps to a value
    ///
    /// Lagging is tolerated; a closed bus or an elapsed timeout is an error.
    pub async fn wait_for<F, T>(&mut self, extract: F, wait: Option<Duration>) -> Result<T, EntityError>
    where
        F: Fn(&EntityEvent) -> Option<T>,
    {
        let entity_id = self.entity_id.clone();
        let receiver = &mut self.receiver;
        let next_match = async {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.entity_id() == entity_id => {
                        if let Some(value) = extract(&event) {
                            return Ok(value);
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(EntityError::Closed(entity_id.clone()));
                    }
                }
            }
        };

        match wait {
            Some(duration) => timeout(duration, next_match)
                .await
                .map_err(|_| EntityError::Timeout(format!("waiting for an event from '{}'", entity_id)))?,
            None => next_match.await,
        }
    }
}

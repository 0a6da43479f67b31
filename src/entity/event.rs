//! Lifecycle events emitted by the entity runtime

use crate::entity::error::EntityError;
use uuid::Uuid;

/// Events published on the runtime's event bus
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    /// First run of an entity began
    Started {
        entity_id: String,
        entity_type: &'static str,
        run_id: Uuid,
    },

    /// A run handed its state to a fresh run
    ContinuedAsNew {
        entity_id: String,
        previous_run_id: Uuid,
        run_id: Uuid,
        /// History length of the run that ended
        history_length: u64,
    },

    /// The entity returned its final result
    Completed { entity_id: String, run_id: Uuid },

    /// The entity's run failed
    Failed {
        entity_id: String,
        run_id: Uuid,
        error: EntityError,
    },

    /// The entity was stopped from outside
    Terminated { entity_id: String },
}

impl EntityEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            EntityEvent::Started { entity_id, .. } => entity_id,
            EntityEvent::ContinuedAsNew { entity_id, .. } => entity_id,
            EntityEvent::Completed { entity_id, .. } => entity_id,
            EntityEvent::Failed { entity_id, .. } => entity_id,
            EntityEvent::Terminated { entity_id } => entity_id,
        }
    }
}

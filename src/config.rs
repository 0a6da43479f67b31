//! Configuration for the entity runtime

/// History length at which a run is told it should continue as new
pub const DEFAULT_CONTINUE_AS_NEW_SUGGESTED_AFTER: u64 = 10_240;

/// Configuration for an [`crate::runtime::EntityRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Messages buffered per entity before senders wait
    pub mailbox_capacity: usize,

    /// Events buffered per event bus subscriber
    pub event_bus_capacity: usize,

    /// History length after which `is_continue_as_new_suggested` turns true
    pub continue_as_new_suggested_after: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
            event_bus_capacity: 100,
            continue_as_new_suggested_after: DEFAULT_CONTINUE_AS_NEW_SUGGESTED_AFTER,
        }
    }
}

impl RuntimeConfig {
    /// Set the per-entity mailbox capacity.
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    /// Set the event bus buffer size.
    pub fn with_event_bus_capacity(mut self, capacity: usize) -> Self {
        self.event_bus_capacity = capacity.max(1);
        self
    }

    /// Set the history length that triggers a continue-as-new suggestion.
    pub fn with_continue_as_new_suggested_after(mut self, length: u64) -> Self {
        self.continue_as_new_suggested_after = length;
        self
    }
}

//! Turn memory: per-thread conversation checkpointing.
//!
//! Keyed by thread identifier: `load` returns the last saved message
//! sequence (empty for an unseen thread), `save` replaces it atomically at
//! the end of an orchestrator run. State lives for the process lifetime and
//! is never expired, which is fine at this system's scale but means memory
//! grows with distinct thread ids. Injectable and resettable so tests own
//! its lifecycle.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::provider::Message;

#[derive(Default)]
pub struct TurnMemory {
    threads: Mutex<HashMap<String, Vec<Message>>>,
}

impl TurnMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message history for a thread; empty if the thread has never been seen.
    pub fn load(&self, thread_id: &str) -> Vec<Message> {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the stored history for a thread.
    pub fn save(&self, thread_id: &str, messages: Vec<Message>) {
        debug!(
            "Checkpointing {} messages for thread {}",
            messages.len(),
            thread_id
        );
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(thread_id.to_string(), messages);
    }

    /// Drop all threads. Test-only escape hatch for shared fixtures.
    pub fn reset(&self) {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn thread_count(&self) -> usize {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

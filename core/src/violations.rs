//! Bounded store of sandbox violations observed at runtime.

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Ring capacity; older events are dropped first.
pub const VIOLATION_CAPACITY: usize = 100;

const SUBSCRIBER_BUFFER: usize = 32;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SandboxViolationEvent {
    /// The denial detail as logged (after the `Sandbox:` marker).
    pub line: String,
    /// The decoded originating command, when a log tag was present.
    pub command: Option<String>,
    /// The base64 key correlating the event to `wrap`'s log tag.
    pub encoded_command: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Shared ring buffer with snapshot-on-subscribe semantics: subscribers
/// get the current contents immediately and the full list after each
/// addition.
#[derive(Clone)]
pub struct ViolationStore {
    events: Arc<Mutex<VecDeque<SandboxViolationEvent>>>,
    updates: broadcast::Sender<Vec<SandboxViolationEvent>>,
}

impl Default for ViolationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ViolationStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(VIOLATION_CAPACITY))),
            updates,
        }
    }

    pub fn record(&self, event: SandboxViolationEvent) {
        let snapshot = {
            let mut events = match self.events.lock() {
                Ok(events) => events,
                Err(poisoned) => poisoned.into_inner(),
            };
            events.push_back(event);
            while events.len() > VIOLATION_CAPACITY {
                events.pop_front();
            }
            events.iter().cloned().collect::<Vec<_>>()
        };
        // No receivers is fine; subscription is optional.
        let _ = self.updates.send(snapshot);
    }

    pub fn snapshot(&self) -> Vec<SandboxViolationEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Violations recorded for the command with this base64 key.
    pub fn for_encoded_command(&self, encoded: &str) -> Vec<SandboxViolationEvent> {
        self.snapshot()
            .into_iter()
            .filter(|event| event.encoded_command.as_deref() == Some(encoded))
            .collect()
    }

    /// Current contents plus a receiver of full-list updates.
    pub fn subscribe(
        &self,
    ) -> (
        Vec<SandboxViolationEvent>,
        broadcast::Receiver<Vec<SandboxViolationEvent>>,
    ) {
        let receiver = self.updates.subscribe();
        (self.snapshot(), receiver)
    }
}

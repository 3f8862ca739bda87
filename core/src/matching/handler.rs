//! Delivery of matching events to the embedder

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::types::MatchingNotification;

/// Receives events from a context's event worker
///
/// Called on the `matching-event-{id}` thread, in the order the events were
/// raised. Implementations must not call back into the engine for the same
/// context while handling an event.
pub trait MatchingHandler: Send + Sync {
    fn on_event(&self, notification: MatchingNotification);
}

/// Handler that queues notifications until the embedder drains them
#[derive(Default)]
pub struct NotificationQueue {
    pending: Mutex<VecDeque<MatchingNotification>>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything queued so far
    pub fn take(&self) -> Vec<MatchingNotification> {
        self.pending.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl MatchingHandler for NotificationQueue {
    fn on_event(&self, notification: MatchingNotification) {
        self.pending.lock().push_back(notification);
    }
}

//! Session change notifications.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::session::ExternalSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A probe verified the KDP login.
    Connected(ExternalSession),
    /// The session was cleared (logout or rejected credentials).
    Invalidated,
}

/// Lets components that depend on the session refresh without polling.
#[derive(Clone)]
pub struct SessionEventBroadcaster {
    sender: Arc<broadcast::Sender<SessionEvent>>,
}

impl SessionEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for SessionEventBroadcaster {
    fn default() -> Self {
        Self::new(16)
    }
}

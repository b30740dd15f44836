//! Book state change notifications for UI re-rendering.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::pipeline::Book;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookEvent {
    Created { book: Book },
    Updated { book: Book },
    Removed { book_id: String },
    /// A reconciliation pass finished; `books` is the merged list.
    Synced { books: Vec<Book> },
}

#[derive(Clone)]
pub struct BookEventBroadcaster {
    sender: Arc<broadcast::Sender<BookEvent>>,
}

impl BookEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: BookEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookEvent> {
        self.sender.subscribe()
    }
}

impl Default for BookEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

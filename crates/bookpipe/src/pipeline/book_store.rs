//! In-memory book list, written through to the key-value store.

use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use log::{error, info};

use crate::broadcast::{BookEvent, BookEventBroadcaster};
use crate::db::{kv_repo, Database, DatabaseError};

use super::book::Book;
use super::error::PipelineError;

/// Key of the persisted book list.
pub const SAVED_BOOKS_KEY: &str = "saved_books";

/// Holds every known book. All mutations go through the write lock, so a
/// read-modify-write such as a queue merge never interleaves with another.
pub struct BookStore {
    books: RwLock<Vec<Book>>,
    db: Option<Database>,
    events: BookEventBroadcaster,
}

impl BookStore {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(Vec::new()),
            db: None,
            events: BookEventBroadcaster::default(),
        }
    }

    /// Restores the saved list and persists every later mutation.
    pub fn load_from_database(db: Database) -> Result<Self, DatabaseError> {
        let books: Vec<Book> = kv_repo::get_json(&db, SAVED_BOOKS_KEY)?.unwrap_or_default();
        info!("Loaded {} saved book(s)", books.len());
        Ok(Self {
            books: RwLock::new(books),
            db: Some(db),
            events: BookEventBroadcaster::default(),
        })
    }

    pub fn events(&self) -> &BookEventBroadcaster {
        &self.events
    }

    pub fn all(&self) -> Vec<Book> {
        self.books
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Book> {
        self.books
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|b| b.id() == id)
            .cloned()
    }

    pub fn insert(&self, books: Vec<Book>) {
        let mut guard = self.lock();
        guard.extend(books.iter().cloned());
        self.persist(&guard);
        drop(guard);
        for book in books {
            self.events.send(BookEvent::Created { book });
        }
    }

    pub fn remove(&self, ids: &[String]) {
        let mut guard = self.lock();
        guard.retain(|b| !ids.iter().any(|id| id == b.id()));
        self.persist(&guard);
        drop(guard);
        for id in ids {
            self.events.send(BookEvent::Removed {
                book_id: id.clone(),
            });
        }
    }

    /// Mutates one book. Nothing is written if `f` fails.
    pub fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Book) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let mut guard = self.lock();
        let book = guard
            .iter_mut()
            .find(|b| b.id() == id)
            .ok_or_else(|| PipelineError::BookNotFound(id.to_string()))?;

        let mut draft = book.clone();
        let value = f(&mut draft)?;
        draft.touch();
        *book = draft.clone();

        self.persist(&guard);
        drop(guard);
        self.events.send(BookEvent::Updated { book: draft });
        Ok(value)
    }

    /// Runs `f` over the whole list under the write lock.
    pub fn with_all<T>(&self, f: impl FnOnce(&mut Vec<Book>) -> T) -> (T, Vec<Book>) {
        let mut guard = self.lock();
        let value = f(&mut guard);
        self.persist(&guard);
        let snapshot = guard.clone();
        drop(guard);
        self.events.send(BookEvent::Synced {
            books: snapshot.clone(),
        });
        (value, snapshot)
    }

    fn lock(&self) -> RwLockWriteGuard<'_, Vec<Book>> {
        self.books.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, books: &[Book]) {
        if let Some(db) = &self.db {
            if let Err(e) = kv_repo::put_json(db, SAVED_BOOKS_KEY, books) {
                error!("Failed to persist saved books: {}", e);
            }
        }
    }
}

impl Default for BookStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BookStatus;

    #[test]
    fn test_update_and_get() {
        let store = BookStore::new();
        let book = Book::new("Sourdough", None);
        let id = book.id().to_string();
        store.insert(vec![book]);

        store
            .update(&id, |b| b.advance_to(BookStatus::Review))
            .unwrap();
        assert_eq!(store.get(&id).unwrap().status(), BookStatus::Review);
    }

    #[test]
    fn test_failed_update_leaves_book_untouched() {
        let store = BookStore::new();
        let book = Book::new("Sourdough", None);
        let id = book.id().to_string();
        store.insert(vec![book.clone()]);

        let result = store.update(&id, |b| {
            b.error = Some("half-applied".into());
            b.advance_to(BookStatus::Uploaded)
        });
        assert!(matches!(result, Err(PipelineError::InvalidTransition { .. })));
        assert_eq!(store.get(&id).unwrap(), book);
    }

    #[test]
    fn test_missing_book() {
        let store = BookStore::new();
        assert!(matches!(
            store.update("nope", |_| Ok(())),
            Err(PipelineError::BookNotFound(_))
        ));
    }

    #[test]
    fn test_persisted_across_reload() {
        let db = Database::open_in_memory().unwrap();
        let store = BookStore::load_from_database(db.clone()).unwrap();
        let book = Book::new("Sourdough", Some("guide to sourdough baking".into()));
        let id = book.id().to_string();
        store.insert(vec![book]);
        store
            .update(&id, |b| {
                b.mark_provisional(BookStatus::Review);
                Ok(())
            })
            .unwrap();

        let reloaded = BookStore::load_from_database(db).unwrap();
        let book = reloaded.get(&id).unwrap();
        assert_eq!(book.prompt.as_deref(), Some("guide to sourdough baking"));
        assert!(book.provisional().is_some());
    }

    #[test]
    fn test_events_are_broadcast() {
        let store = BookStore::new();
        let mut rx = store.events().subscribe();
        let book = Book::new("Sourdough", None);
        let id = book.id().to_string();
        store.insert(vec![book]);
        store.remove(&[id.clone()]);

        assert!(matches!(rx.try_recv(), Ok(BookEvent::Created { .. })));
        assert!(matches!(rx.try_recv(), Ok(BookEvent::Removed { book_id }) if book_id == id));
        assert!(store.all().is_empty());
    }
}

//! Reconciliation of local books against the remote book queue.
//!
//! The remote queue is authoritative with one exception: a merge never moves
//! a book backwards, except Review to Pending for a book whose regeneration
//! was requested.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tracing::{info_span, Instrument};

use crate::api::{PublishingApi, RemoteQueueEntry};
use crate::retry::RetryPolicy;

use super::book::{Book, BookStatus};
use super::book_store::BookStore;
use super::error::PipelineError;

/// Something the remote queue disagrees with, logged and otherwise ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// Several unmatched local books share the entry's title.
    AmbiguousTitle { title: String, candidates: Vec<String> },
    /// The queue lists the same book more than once.
    DuplicateRemote { key: String },
    /// The remote status is behind the local one.
    RemoteBehind {
        book_id: String,
        local: BookStatus,
        remote: BookStatus,
    },
    /// The remote says Review while a requested regeneration is outstanding.
    AwaitingRegeneration { book_id: String },
    UnknownStatus { title: String, status: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub matched: usize,
    /// Local books matched through the deprecated title fallback.
    pub matched_by_title: Vec<String>,
    pub added: Vec<String>,
    pub advanced: Vec<(String, BookStatus)>,
    pub confirmed: Vec<String>,
    pub discrepancies: Vec<Discrepancy>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.advanced.is_empty() || !self.confirmed.is_empty()
    }
}

/// Merges the remote queue into `books` in place.
pub fn merge(books: &mut Vec<Book>, remote: &[RemoteQueueEntry]) -> MergeReport {
    let mut report = MergeReport::default();
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut seen: HashSet<String> = HashSet::new();

    for entry in remote {
        let remote_id = entry.id.as_deref().filter(|id| !id.is_empty());
        let key = match remote_id {
            Some(id) => format!("id:{}", id),
            None => format!("title:{}", entry.title),
        };
        if !seen.insert(key.clone()) {
            warn!("Remote queue lists '{}' more than once; ignoring repeat", key);
            report.discrepancies.push(Discrepancy::DuplicateRemote { key });
            continue;
        }

        let status = BookStatus::parse(&entry.status);
        if status.is_none() {
            warn!(
                "Unknown remote status '{}' for '{}'; leaving status untouched",
                entry.status, entry.title
            );
            report.discrepancies.push(Discrepancy::UnknownStatus {
                title: entry.title.clone(),
                status: entry.status.clone(),
            });
        }

        let by_id = remote_id.and_then(|id| books.iter().position(|b| b.id() == id));
        let index = match by_id {
            Some(index) if claimed.contains(&index) => {
                report
                    .discrepancies
                    .push(Discrepancy::DuplicateRemote { key: key.clone() });
                continue;
            }
            Some(index) => Some(index),
            None => {
                let candidates: Vec<usize> = books
                    .iter()
                    .enumerate()
                    .filter(|(i, b)| !claimed.contains(i) && b.title == entry.title)
                    .map(|(i, _)| i)
                    .collect();
                match candidates.as_slice() {
                    [] => None,
                    [single] => {
                        warn!(
                            "Matched remote entry '{}' to local book {} by title; the backend should echo book ids",
                            entry.title,
                            books[*single].id()
                        );
                        report.matched_by_title.push(books[*single].id().to_string());
                        Some(*single)
                    }
                    many => {
                        warn!(
                            "Remote entry '{}' matches {} local books by title; skipping",
                            entry.title,
                            many.len()
                        );
                        report.discrepancies.push(Discrepancy::AmbiguousTitle {
                            title: entry.title.clone(),
                            candidates: many.iter().map(|&i| books[i].id().to_string()).collect(),
                        });
                        continue;
                    }
                }
            }
        };

        match index {
            Some(index) => {
                claimed.insert(index);
                report.matched += 1;
                apply_entry(&mut books[index], entry, status, &mut report);
            }
            None => match status {
                Some(status) => {
                    let book = Book::from_remote(entry, status);
                    info!("New book '{}' ({}) found in remote queue", book.title, status);
                    report.added.push(book.id().to_string());
                    claimed.insert(books.len());
                    books.push(book);
                }
                None => debug!("Skipping unmatched remote entry '{}'", entry.title),
            },
        }
    }

    report
}

fn apply_entry(
    book: &mut Book,
    entry: &RemoteQueueEntry,
    remote: Option<BookStatus>,
    report: &mut MergeReport,
) {
    if let Some(remote) = remote {
        let local = book.status();
        if remote > local {
            if local == BookStatus::Pending && book.regeneration_requested() {
                debug!("Book {} awaits regeneration; remote still {}", book.id(), remote);
                report.discrepancies.push(Discrepancy::AwaitingRegeneration {
                    book_id: book.id().to_string(),
                });
            } else {
                // Walk through every intermediate status.
                while let Some(next) = book.status().next().filter(|n| *n <= remote) {
                    if book.advance_to(next).is_err() {
                        break;
                    }
                }
                report
                    .advanced
                    .push((book.id().to_string(), book.status()));
            }
        } else if remote < local {
            warn!(
                "Remote queue shows book {} as {} but it is {} locally; keeping local",
                book.id(),
                remote,
                local
            );
            report.discrepancies.push(Discrepancy::RemoteBehind {
                book_id: book.id().to_string(),
                local,
                remote,
            });
        }
    }
    book.apply_remote_fields(entry);

    if book.confirm_provisional() {
        report.confirmed.push(book.id().to_string());
    }
}

/// Fetches the queue and merges it into the book store.
pub struct QueueSynchronizer {
    api: Arc<dyn PublishingApi>,
    store: Arc<BookStore>,
    policy: RetryPolicy,
}

impl QueueSynchronizer {
    pub fn new(api: Arc<dyn PublishingApi>, store: Arc<BookStore>, policy: RetryPolicy) -> Self {
        Self { api, store, policy }
    }

    /// Safe to call concurrently; each merge runs under the store's write lock
    /// against its own fetch, so the last merge wins.
    pub async fn reconcile(&self) -> Result<(Vec<Book>, MergeReport), PipelineError> {
        let remote = self
            .policy
            .run("book-queue", |_| self.api.book_queue())
            .instrument(info_span!("reconcile"))
            .await?;

        let (report, books) = self.store.with_all(|books| merge(books, &remote));
        if report.changed() || !report.discrepancies.is_empty() {
            info!(
                "Reconciled {} remote entries: {} matched, {} added, {} advanced, {} discrepancies",
                remote.len(),
                report.matched,
                report.added.len(),
                report.advanced.len(),
                report.discrepancies.len()
            );
        }
        Ok((books, report))
    }
}

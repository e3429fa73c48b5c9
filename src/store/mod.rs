//! Durable state behind the engine: the catalog, the reservation ledger and
//! the fulfillment ledger.
//!
//! The engine only sees the three access traits below. [`LibraryStore`]
//! implements all of them over in-memory maps made durable by the WAL.
//! Every mutation for a book key runs under that key's write lock, so the
//! constraint check, the log append and the in-memory apply form one
//! serializable step per key. The engine's own checks are only a fast path.

mod catalog;
mod ledger;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;
use crate::wal::Wal;

// ── Access contracts ─────────────────────────────────────

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_books(&self) -> Result<Vec<Book>, EngineError>;

    async fn find_book(&self, isbn: &str) -> Result<Option<Book>, EngineError>;

    /// Fails with `DuplicateBook` if the key is taken.
    async fn insert_book(&self, book: Book) -> Result<(), EngineError>;

    /// Returns `false` if no book matched. Refuses with `CheckedOutBook`
    /// while the book is checked out; otherwise the book's reservations go
    /// with it.
    async fn delete_book(&self, isbn: &str) -> Result<bool, EngineError>;

    /// Books within `radius_m` meters of `center` (inclusive), nearest first,
    /// paired with their distance. Equal distances are ordered by key.
    async fn books_within(
        &self,
        center: GeoPoint,
        radius_m: f64,
    ) -> Result<Vec<(Book, f64)>, EngineError>;
}

#[async_trait]
pub trait ReservationLedger: Send + Sync {
    async fn overlapping(&self, isbn: &str, span: Span) -> Result<Vec<Reservation>, EngineError>;

    /// Exclusion-checked insert: fails with `Overlap` if any reservation for
    /// the same key overlaps, and `BookNotFound` if the key is not catalogued.
    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), EngineError>;

    async fn find_exact(&self, isbn: &str, span: Span) -> Result<Option<Reservation>, EngineError>;

    async fn find_reservation(&self, id: Ulid) -> Result<Option<Reservation>, EngineError>;

    /// Sorted by start.
    async fn reservations_for(&self, isbn: &str) -> Result<Vec<Reservation>, EngineError>;

    /// Keys holding at least one reservation that overlaps `span`.
    async fn reserved_during(&self, span: Span) -> Result<HashSet<String>, EngineError>;
}

#[async_trait]
pub trait FulfillmentLedger: Send + Sync {
    async fn fulfillment(&self, isbn: &str) -> Result<Option<Fulfillment>, EngineError>;

    /// Unique per key: fails with `AlreadyCheckedOut` if the key already has
    /// one, and `UnknownReservation` if the referenced reservation is not
    /// held against the same key.
    async fn insert_fulfillment(&self, fulfillment: Fulfillment) -> Result<(), EngineError>;

    /// Returns `false` if the key was not checked out.
    async fn delete_fulfillment(&self, isbn: &str) -> Result<bool, EngineError>;
}

/// Everything the engine needs from its store.
pub trait Backend: CatalogStore + ReservationLedger + FulfillmentLedger {}

impl<T> Backend for T where T: CatalogStore + ReservationLedger + FulfillmentLedger {}

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Flush what we have before the non-append command runs.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── LibraryStore ─────────────────────────────────────────

pub type SharedLedger = Arc<RwLock<BookLedger>>;

pub struct LibraryStore {
    books: DashMap<String, Book>,
    /// Per-key ledgers. An entry doubles as the key's row lock, so entries
    /// are never removed once created.
    ledgers: DashMap<String, SharedLedger>,
    /// Reverse lookup: reservation id → book key.
    reservation_index: DashMap<Ulid, String>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Mutations hold this shared; compaction holds it exclusively.
    gate: RwLock<()>,
}

/// Apply an event to a key's ledger and the shared indexes (caller holds the
/// key's lock).
fn apply_event(
    ledger: &mut BookLedger,
    event: &Event,
    books: &DashMap<String, Book>,
    index: &DashMap<Ulid, String>,
) {
    match event {
        Event::BookAdded { book } => {
            books.insert(book.isbn.clone(), book.clone());
        }
        Event::BookDeleted { isbn } => {
            books.remove(isbn);
            for r in ledger.clear() {
                index.remove(&r.id);
            }
        }
        Event::ReservationPlaced { id, isbn, span } => {
            ledger.insert_reservation(Reservation {
                id: *id,
                isbn: isbn.clone(),
                span: *span,
            });
            index.insert(*id, isbn.clone());
        }
        Event::CheckedOut { isbn, reservation_id } => {
            ledger.checkout = Some(Fulfillment {
                isbn: isbn.clone(),
                reservation_id: *reservation_id,
            });
        }
        Event::Returned { .. } => {
            ledger.checkout = None;
        }
    }
}

impl LibraryStore {
    /// Store with no log: state lives and dies with the process.
    pub fn in_memory() -> Self {
        Self {
            books: DashMap::new(),
            ledgers: DashMap::new(),
            reservation_index: DashMap::new(),
            wal_tx: None,
            gate: RwLock::new(()),
        }
    }

    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let books = DashMap::new();
        let reservation_index = DashMap::new();
        let mut ledgers: HashMap<String, BookLedger> = HashMap::new();
        for event in &events {
            let ledger = ledgers.entry(event.isbn().to_string()).or_default();
            apply_event(ledger, event, &books, &reservation_index);
        }
        info!(
            "replayed {} events: {} books, {} reservations",
            events.len(),
            books.len(),
            reservation_index.len()
        );
        metrics::gauge!(crate::observability::BOOKS_TOTAL).set(books.len() as f64);

        Ok(Self {
            books,
            ledgers: ledgers
                .into_iter()
                .map(|(k, v)| (k, Arc::new(RwLock::new(v))))
                .collect(),
            reservation_index,
            wal_tx: Some(wal_tx),
            gate: RwLock::new(()),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.wal_tx.is_some()
    }

    pub fn book_count(&self) -> usize {
        self.books.len()
    }

    fn ledger(&self, isbn: &str) -> SharedLedger {
        if let Some(entry) = self.ledgers.get(isbn) {
            return entry.value().clone();
        }
        self.ledgers.entry(isbn.to_string()).or_default().value().clone()
    }

    fn existing_ledger(&self, isbn: &str) -> Option<SharedLedger> {
        self.ledgers.get(isbn).map(|e| e.value().clone())
    }

    /// Acquire the key's row lock for writing.
    pub(crate) async fn lock_key(&self, isbn: &str) -> OwnedRwLockWriteGuard<BookLedger> {
        self.ledger(isbn).write_owned().await
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. Caller holds the key's write lock.
    pub(crate) async fn persist_and_apply(
        &self,
        ledger: &mut BookLedger,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        apply_event(ledger, &event, &self.books, &self.reservation_index);
        if matches!(event, Event::BookAdded { .. } | Event::BookDeleted { .. }) {
            metrics::gauge!(crate::observability::BOOKS_TOTAL).set(self.books.len() as f64);
        }
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Blocks mutations for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _exclusive = self.gate.write().await;

        let mut events: Vec<Event> = self
            .books
            .iter()
            .map(|e| Event::BookAdded { book: e.value().clone() })
            .collect();

        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        for ledger in ledgers {
            let guard = ledger.read().await;
            for r in &guard.reservations {
                events.push(Event::ReservationPlaced {
                    id: r.id,
                    isbn: r.isbn.clone(),
                    span: r.span,
                });
            }
            if let Some(f) = &guard.checkout {
                events.push(Event::CheckedOut {
                    isbn: f.isbn.clone(),
                    reservation_id: f.reservation_id,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

use async_trait::async_trait;

use crate::engine::EngineError;
use crate::geo::distance_m;
use crate::model::*;

use super::{CatalogStore, LibraryStore};

#[async_trait]
impl CatalogStore for LibraryStore {
    async fn list_books(&self) -> Result<Vec<Book>, EngineError> {
        Ok(self.books.iter().map(|e| e.value().clone()).collect())
    }

    async fn find_book(&self, isbn: &str) -> Result<Option<Book>, EngineError> {
        Ok(self.books.get(isbn).map(|e| e.value().clone()))
    }

    async fn insert_book(&self, book: Book) -> Result<(), EngineError> {
        let _shared = self.gate.read().await;
        let mut guard = self.lock_key(&book.isbn).await;
        if self.books.contains_key(&book.isbn) {
            return Err(EngineError::DuplicateBook(book.isbn));
        }
        self.persist_and_apply(&mut guard, Event::BookAdded { book }).await
    }

    async fn delete_book(&self, isbn: &str) -> Result<bool, EngineError> {
        let _shared = self.gate.read().await;
        let Some(ledger) = self.existing_ledger(isbn) else {
            return Ok(false);
        };
        let mut guard = ledger.write_owned().await;
        if !self.books.contains_key(isbn) {
            return Ok(false);
        }
        if guard.checkout.is_some() {
            return Err(EngineError::CheckedOutBook(isbn.to_string()));
        }
        let event = Event::BookDeleted { isbn: isbn.to_string() };
        self.persist_and_apply(&mut guard, event).await?;
        Ok(true)
    }

    async fn books_within(
        &self,
        center: GeoPoint,
        radius_m: f64,
    ) -> Result<Vec<(Book, f64)>, EngineError> {
        let mut hits: Vec<(Book, f64)> = self
            .books
            .iter()
            .filter_map(|e| {
                let d = distance_m(&center, &e.value().position);
                (d <= radius_m).then(|| (e.value().clone(), d))
            })
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.isbn.cmp(&b.0.isbn)));
        Ok(hits)
    }
}

use crate::geo::km_to_m;
use crate::model::*;
use crate::store::{Backend, CatalogStore, ReservationLedger};

use super::conflict::{parse_span, validate_isbn, validate_position, validate_radius_km};
use super::{Engine, EngineError};

impl<B: Backend> Engine<B> {
    /// All books, ordered by isbn.
    pub async fn list_catalog(&self) -> Result<Vec<Book>, EngineError> {
        let mut books = self.store.list_books().await?;
        books.sort_by(|a, b| a.isbn.cmp(&b.isbn));
        Ok(books)
    }

    pub async fn get_book(&self, isbn: &str) -> Result<Book, EngineError> {
        validate_isbn(isbn)?;
        self.store
            .find_book(isbn)
            .await?
            .ok_or_else(|| EngineError::BookNotFound(isbn.to_string()))
    }

    /// Books within `radius_km` of `center` with no reservation overlapping
    /// `[start, end)`, nearest first.
    ///
    /// Read committed, not a snapshot: the reserved set and the proximity scan
    /// are separate reads, so a Reserve committing between them may or may not
    /// be reflected. Every reservation committed before the call is excluded.
    pub async fn search(
        &self,
        center: GeoPoint,
        radius_km: f64,
        start: &str,
        end: &str,
    ) -> Result<Vec<Book>, EngineError> {
        let span = parse_span(start, end)?;
        validate_position(&center)?;
        let radius_m = km_to_m(validate_radius_km(radius_km)?);

        let reserved = self.store.reserved_during(span).await?;
        let hits = self.store.books_within(center, radius_m).await?;
        Ok(hits
            .into_iter()
            .filter(|(book, _)| !reserved.contains(&book.isbn))
            .map(|(book, _)| book)
            .collect())
    }

    /// Reservations held against `isbn`, ordered by start.
    pub async fn list_reservations(&self, isbn: &str) -> Result<Vec<Reservation>, EngineError> {
        validate_isbn(isbn)?;
        self.store.reservations_for(isbn).await
    }
}

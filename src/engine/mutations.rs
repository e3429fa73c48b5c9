use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_no_overlap, parse_span, validate_book, validate_isbn, validate_span};
use super::{Engine, EngineError};
use crate::store::{Backend, CatalogStore, FulfillmentLedger, ReservationLedger};

impl<B: Backend> Engine<B> {
    pub async fn add_book(&self, draft: BookDraft) -> Result<(), EngineError> {
        let book = validate_book(draft)?;
        let isbn = book.isbn.clone();
        self.store.insert_book(book).await?;
        info!("added book {isbn}");
        Ok(())
    }

    /// Removes the book and its reservations. Refused while checked out.
    pub async fn delete_book(&self, isbn: &str) -> Result<(), EngineError> {
        validate_isbn(isbn)?;
        if !self.store.delete_book(isbn).await? {
            return Err(EngineError::BookNotFound(isbn.to_string()));
        }
        info!("deleted book {isbn}");
        Ok(())
    }

    /// Hold `isbn` for `[start, end)`. The returned reservation carries the
    /// new id.
    pub async fn reserve(
        &self,
        isbn: &str,
        start: &str,
        end: &str,
    ) -> Result<Reservation, EngineError> {
        let span = parse_span(start, end)?;
        validate_span(&span)?;
        validate_isbn(isbn)?;
        if self.store.find_book(isbn).await?.is_none() {
            return Err(EngineError::BookNotFound(isbn.to_string()));
        }

        let existing = self.store.overlapping(isbn, span).await?;
        check_no_overlap(isbn, &span, &existing)?;

        let reservation = Reservation {
            id: Ulid::new(),
            isbn: isbn.to_string(),
            span,
        };
        self.store.insert_reservation(reservation.clone()).await?;
        info!("reserved {isbn} [{}, {}) as {}", span.start, span.end, reservation.id);
        Ok(reservation)
    }

    /// Check out against the reservation matching `(isbn, start, end)` exactly.
    pub async fn checkout(&self, isbn: &str, start: &str, end: &str) -> Result<Ulid, EngineError> {
        let span = parse_span(start, end)?;
        validate_span(&span)?;
        validate_isbn(isbn)?;
        let reservation = self
            .store
            .find_exact(isbn, span)
            .await?
            .ok_or_else(|| EngineError::ReservationNotFound {
                isbn: isbn.to_string(),
                span,
            })?;
        self.fulfill(reservation).await
    }

    /// Check out by reservation id. Returns the book's isbn.
    pub async fn checkout_reservation(&self, id: Ulid) -> Result<String, EngineError> {
        let reservation = self
            .store
            .find_reservation(id)
            .await?
            .ok_or(EngineError::UnknownReservation(id))?;
        let isbn = reservation.isbn.clone();
        self.fulfill(reservation).await?;
        Ok(isbn)
    }

    async fn fulfill(&self, reservation: Reservation) -> Result<Ulid, EngineError> {
        if let Some(existing) = self.store.fulfillment(&reservation.isbn).await? {
            return Err(EngineError::AlreadyCheckedOut {
                isbn: reservation.isbn,
                reservation_id: existing.reservation_id,
            });
        }
        let id = reservation.id;
        self.store
            .insert_fulfillment(Fulfillment {
                isbn: reservation.isbn.clone(),
                reservation_id: id,
            })
            .await?;
        info!("checked out {} under {id}", reservation.isbn);
        Ok(id)
    }

    pub async fn return_book(&self, isbn: &str) -> Result<(), EngineError> {
        validate_isbn(isbn)?;
        if !self.store.delete_fulfillment(isbn).await? {
            return Err(EngineError::NotCheckedOut(isbn.to_string()));
        }
        info!("returned {isbn}");
        Ok(())
    }
}

use std::collections::HashSet;

use async_trait::async_trait;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

use super::{FulfillmentLedger, LibraryStore, ReservationLedger, SharedLedger};

#[async_trait]
impl ReservationLedger for LibraryStore {
    async fn overlapping(&self, isbn: &str, span: Span) -> Result<Vec<Reservation>, EngineError> {
        let Some(ledger) = self.existing_ledger(isbn) else {
            return Ok(Vec::new());
        };
        let guard = ledger.read().await;
        Ok(guard.overlapping(&span).to_vec())
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), EngineError> {
        let _shared = self.gate.read().await;
        let mut guard = self.lock_key(&reservation.isbn).await;
        if !self.books.contains_key(&reservation.isbn) {
            return Err(EngineError::BookNotFound(reservation.isbn));
        }
        if let Some(existing) = guard.overlapping(&reservation.span).first() {
            return Err(EngineError::Overlap {
                isbn: reservation.isbn,
                existing: existing.id,
                span: existing.span,
            });
        }
        let event = Event::ReservationPlaced {
            id: reservation.id,
            isbn: reservation.isbn,
            span: reservation.span,
        };
        self.persist_and_apply(&mut guard, event).await
    }

    async fn find_exact(&self, isbn: &str, span: Span) -> Result<Option<Reservation>, EngineError> {
        let Some(ledger) = self.existing_ledger(isbn) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.find_exact(&span).cloned())
    }

    async fn find_reservation(&self, id: Ulid) -> Result<Option<Reservation>, EngineError> {
        let Some(isbn) = self.reservation_index.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let Some(ledger) = self.existing_ledger(&isbn) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.find_by_id(&id).cloned())
    }

    async fn reservations_for(&self, isbn: &str) -> Result<Vec<Reservation>, EngineError> {
        let Some(ledger) = self.existing_ledger(isbn) else {
            return Ok(Vec::new());
        };
        let guard = ledger.read().await;
        Ok(guard.reservations.clone())
    }

    async fn reserved_during(&self, span: Span) -> Result<HashSet<String>, EngineError> {
        // Snapshot the handles first: never hold a DashMap guard across an await.
        let ledgers: Vec<(String, SharedLedger)> = self
            .ledgers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut reserved = HashSet::new();
        for (isbn, ledger) in ledgers {
            let guard = ledger.read().await;
            if !guard.overlapping(&span).is_empty() {
                reserved.insert(isbn);
            }
        }
        Ok(reserved)
    }
}

#[async_trait]
impl FulfillmentLedger for LibraryStore {
    async fn fulfillment(&self, isbn: &str) -> Result<Option<Fulfillment>, EngineError> {
        let Some(ledger) = self.existing_ledger(isbn) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.checkout.clone())
    }

    async fn insert_fulfillment(&self, fulfillment: Fulfillment) -> Result<(), EngineError> {
        let _shared = self.gate.read().await;
        let mut guard = self.lock_key(&fulfillment.isbn).await;
        if let Some(existing) = &guard.checkout {
            return Err(EngineError::AlreadyCheckedOut {
                isbn: fulfillment.isbn,
                reservation_id: existing.reservation_id,
            });
        }
        if guard.find_by_id(&fulfillment.reservation_id).is_none() {
            return Err(EngineError::UnknownReservation(fulfillment.reservation_id));
        }
        let event = Event::CheckedOut {
            isbn: fulfillment.isbn,
            reservation_id: fulfillment.reservation_id,
        };
        self.persist_and_apply(&mut guard, event).await
    }

    async fn delete_fulfillment(&self, isbn: &str) -> Result<bool, EngineError> {
        let _shared = self.gate.read().await;
        let Some(ledger) = self.existing_ledger(isbn) else {
            return Ok(false);
        };
        let mut guard = ledger.write_owned().await;
        if guard.checkout.is_none() {
            return Ok(false);
        }
        let event = Event::Returned { isbn: isbn.to_string() };
        self.persist_and_apply(&mut guard, event).await?;
        Ok(true)
    }
}

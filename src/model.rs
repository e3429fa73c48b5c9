use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Position in decimal degrees (WGS 84).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub isbn: String,
    pub library: String,
    pub price: f64,
    pub position: GeoPoint,
}

/// Unvalidated input to `add_book`. Position fields are optional so that a
/// missing coordinate can be reported instead of silently defaulting to 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookDraft {
    pub isbn: String,
    pub library: String,
    pub price: f64,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub isbn: String,
    pub span: Span,
}

/// A checked-out book and the reservation that authorized it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub isbn: String,
    pub reservation_id: Ulid,
}

/// Everything the store tracks for one book key besides the catalog row.
#[derive(Debug, Default)]
pub struct BookLedger {
    /// Disjoint reservations sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    pub checkout: Option<Fulfillment>,
}

impl BookLedger {
    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    /// Reservations whose span overlaps the query window.
    ///
    /// Reservations are disjoint, so sorting by start also sorts by end and
    /// both bounds can be found by binary search.
    pub fn overlapping(&self, query: &Span) -> &[Reservation] {
        let right = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        let left = self.reservations[..right].partition_point(|r| r.span.end <= query.start);
        &self.reservations[left..right]
    }

    pub fn find_exact(&self, span: &Span) -> Option<&Reservation> {
        self.reservations
            .binary_search_by_key(&span.start, |r| r.span.start)
            .ok()
            .map(|pos| &self.reservations[pos])
            .filter(|r| r.span.end == span.end)
    }

    pub fn find_by_id(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn clear(&mut self) -> Vec<Reservation> {
        self.checkout = None;
        std::mem::take(&mut self.reservations)
    }
}

/// Flat event types; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    BookAdded {
        book: Book,
    },
    /// Also drops every reservation held against the key.
    BookDeleted {
        isbn: String,
    },
    ReservationPlaced {
        id: Ulid,
        isbn: String,
        span: Span,
    },
    CheckedOut {
        isbn: String,
        reservation_id: Ulid,
    },
    Returned {
        isbn: String,
    },
}

impl Event {
    pub fn isbn(&self) -> &str {
        match self {
            Event::BookAdded { book } => &book.isbn,
            Event::BookDeleted { isbn }
            | Event::ReservationPlaced { isbn, .. }
            | Event::CheckedOut { isbn, .. }
            | Event::Returned { isbn } => isbn,
        }
    }
}

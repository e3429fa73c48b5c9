use ulid::Ulid;

use crate::model::Span;
use crate::window::WindowError;

/// Coarse classification every `EngineError` falls into. The transport maps
/// these to protocol status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    StoreError,
}

#[derive(Debug)]
pub enum EngineError {
    // ── InvalidArgument ──
    InvalidWindow(WindowError),
    InvertedWindow { start: i64, end: i64 },
    MissingField(&'static str),
    InvalidField { field: &'static str, reason: &'static str },
    LimitExceeded(&'static str),

    // ── NotFound ──
    BookNotFound(String),
    ReservationNotFound { isbn: String, span: Span },
    UnknownReservation(Ulid),

    // ── Conflict ──
    DuplicateBook(String),
    Overlap { isbn: String, existing: Ulid, span: Span },
    AlreadyCheckedOut { isbn: String, reservation_id: Ulid },
    NotCheckedOut(String),
    CheckedOutBook(String),

    // ── StoreError ──
    WalError(String),
    Unavailable(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidWindow(_)
            | EngineError::InvertedWindow { .. }
            | EngineError::MissingField(_)
            | EngineError::InvalidField { .. }
            | EngineError::LimitExceeded(_) => ErrorKind::InvalidArgument,
            EngineError::BookNotFound(_)
            | EngineError::ReservationNotFound { .. }
            | EngineError::UnknownReservation(_) => ErrorKind::NotFound,
            EngineError::DuplicateBook(_)
            | EngineError::Overlap { .. }
            | EngineError::AlreadyCheckedOut { .. }
            | EngineError::NotCheckedOut(_)
            | EngineError::CheckedOutBook(_) => ErrorKind::Conflict,
            EngineError::WalError(_) | EngineError::Unavailable(_) => ErrorKind::StoreError,
        }
    }
}

impl From<WindowError> for EngineError {
    fn from(e: WindowError) -> Self {
        EngineError::InvalidWindow(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow(e) => write!(f, "{e}"),
            EngineError::InvertedWindow { start, end } => {
                write!(f, "invalid time range: start {start} is not before end {end}")
            }
            EngineError::MissingField(field) => write!(f, "missing required field: {field}"),
            EngineError::InvalidField { field, reason } => write!(f, "invalid {field}: {reason}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::BookNotFound(isbn) => write!(f, "book not found: {isbn}"),
            EngineError::ReservationNotFound { isbn, span } => write!(
                f,
                "no reservation for {isbn} matching [{}, {})",
                span.start, span.end
            ),
            EngineError::UnknownReservation(id) => write!(f, "reservation not found: {id}"),
            EngineError::DuplicateBook(isbn) => write!(f, "book already exists: {isbn}"),
            EngineError::Overlap { isbn, existing, .. } => write!(
                f,
                "reservation overlaps with an existing slot: {isbn} (reservation {existing})"
            ),
            EngineError::AlreadyCheckedOut { isbn, reservation_id } => write!(
                f,
                "book already checked out: {isbn} (reservation {reservation_id})"
            ),
            EngineError::NotCheckedOut(isbn) => write!(f, "book has not been checked out: {isbn}"),
            EngineError::CheckedOutBook(isbn) => {
                write!(f, "cannot delete book {isbn}: currently checked out")
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

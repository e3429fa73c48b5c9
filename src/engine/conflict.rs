use crate::geo::is_valid_position;
use crate::limits::*;
use crate::model::*;
use crate::window::parse_window;

use super::EngineError;

pub(crate) fn validate_isbn(isbn: &str) -> Result<(), EngineError> {
    if isbn.is_empty() {
        return Err(EngineError::MissingField("isbn"));
    }
    if isbn.len() > MAX_ISBN_LEN {
        return Err(EngineError::LimitExceeded("isbn too long"));
    }
    Ok(())
}

/// Parse and order-check a window. Both bounds are required. Width is not
/// checked here: search windows may be arbitrarily wide.
pub(crate) fn parse_span(start: &str, end: &str) -> Result<Span, EngineError> {
    let (start, end) = parse_window(start, end)?;
    if start >= end {
        return Err(EngineError::InvertedWindow { start, end });
    }
    Ok(Span::new(start, end))
}

/// Bounds on a window that will be held against a book.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_position(position: &GeoPoint) -> Result<(), EngineError> {
    if !position.lat.is_finite() || !(-90.0..=90.0).contains(&position.lat) {
        return Err(EngineError::InvalidField {
            field: "lat",
            reason: "must be within [-90, 90]",
        });
    }
    if !is_valid_position(position) {
        return Err(EngineError::InvalidField {
            field: "lng",
            reason: "must be within [-180, 180]",
        });
    }
    Ok(())
}

pub(crate) fn validate_book(draft: BookDraft) -> Result<Book, EngineError> {
    validate_isbn(&draft.isbn)?;
    if draft.library.len() > MAX_LIBRARY_LEN {
        return Err(EngineError::LimitExceeded("library name too long"));
    }
    if !draft.price.is_finite() {
        return Err(EngineError::InvalidField {
            field: "price",
            reason: "must be a finite number",
        });
    }
    let lat = draft.lat.ok_or(EngineError::MissingField("lat"))?;
    let lng = draft.lng.ok_or(EngineError::MissingField("lng"))?;
    let position = GeoPoint::new(lat, lng);
    validate_position(&position)?;
    Ok(Book {
        isbn: draft.isbn,
        library: draft.library,
        price: draft.price,
        position,
    })
}

/// Radii beyond half the circumference are clamped; they already cover the globe.
pub(crate) fn validate_radius_km(radius_km: f64) -> Result<f64, EngineError> {
    if radius_km.is_nan() || radius_km < 0.0 {
        return Err(EngineError::InvalidField {
            field: "radius_km",
            reason: "must be a non-negative number",
        });
    }
    Ok(radius_km.min(MAX_SEARCH_RADIUS_KM))
}

/// Fast-path overlap check against a snapshot. The store re-checks under the
/// key lock.
pub(crate) fn check_no_overlap(
    isbn: &str,
    span: &Span,
    existing: &[Reservation],
) -> Result<(), EngineError> {
    match existing.iter().find(|r| r.span.overlaps(span)) {
        Some(r) => Err(EngineError::Overlap {
            isbn: isbn.to_string(),
            existing: r.id,
            span: r.span,
        }),
        None => Ok(()),
    }
}

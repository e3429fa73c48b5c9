use crate::model::Ms;

pub const MAX_ISBN_LEN: usize = 64;
pub const MAX_LIBRARY_LEN: usize = 256;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Ten years.
pub const MAX_SPAN_DURATION_MS: Ms = 10 * 366 * 24 * 3_600_000;

/// Half the Earth's circumference; anything larger covers the whole globe.
pub const MAX_SEARCH_RADIUS_KM: f64 = 20_037.5;

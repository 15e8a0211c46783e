//! UUID v7 utilities for time-ordered job identifiers.
//!
//! Job ids are UUIDv7, which embed a millisecond Unix timestamp in the first
//! 48 bits. Sorting by id therefore sorts by submission time.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use thumbforge_core::uuid_utils::new_v7;
///
/// let earlier = new_v7();
/// let later = new_v7();
/// assert!(later > earlier);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Extract the embedded timestamp from a UUIDv7.
///
/// Returns `None` for any other UUID version.
pub fn extract_timestamp(id: &Uuid) -> Option<DateTime<Utc>> {
    if id.get_version_num() != 7 {
        return None;
    }
    let bytes = id.as_bytes();
    let millis = bytes[..6]
        .iter()
        .fold(0i64, |acc, b| (acc << 8) | i64::from(*b));
    Utc.timestamp_millis_opt(millis).single()
}

//! Time-sortable identifiers.
//!
//! Sessions, instances and store documents are keyed by UUID v7 strings.
//! The leading 48 bits hold the Unix time in milliseconds, so ids sort by
//! creation time and the creation timestamp can be recovered from the id
//! alone (the context dump's `date` field is derived this way).

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a new globally unique, time-sortable id.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Recover the creation time embedded in an id produced by [`new_id`].
///
/// Returns `None` for strings that are not v7 UUIDs.
pub fn id_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let uuid = Uuid::parse_str(id).ok()?;
    let ts = uuid.get_timestamp()?;
    let (secs, nanos) = ts.to_unix();
    DateTime::from_timestamp(secs as i64, nanos)
}

/// RFC 3339 creation date for an id, or an empty string when the id
/// carries no timestamp.
pub fn id_date_string(id: &str) -> String {
    id_timestamp(id)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

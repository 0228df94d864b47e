//! Time-sortable document ids and the millisecond clock.
//!
//! Ids are UUIDv7: the top 48 bits carry the Unix millisecond timestamp of
//! issuance, the remaining bits are cryptographic randomness, so the
//! lexicographic order of the canonical string form matches issuance order
//! within the resolution of the clock.

use uuid::{NoContext, Timestamp, Uuid};

/// Generates a fresh document id.
pub fn new_id() -> String {
    new_id_at(now_ms())
}

/// Generates a document id stamped with the given millisecond timestamp.
///
/// Operations that already read the clock pass their cached instant here so
/// the id and the document timestamps observe the same moment.
pub fn new_id_at(ms: i64) -> String {
    let ms = ms.max(0) as u64;
    let ts = Timestamp::from_unix(NoContext, ms / 1000, (ms % 1000) as u32 * 1_000_000);
    Uuid::new_v7(ts).to_string()
}

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Not monotonic; callers cache one read per operation.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

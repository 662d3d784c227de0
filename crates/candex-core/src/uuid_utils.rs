//! UUID v7 helpers.
//!
//! Candidates, jobs, raw receipts and ingest runs all use UUIDv7 ids so that
//! id order follows creation order.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use candex_core::uuid_utils::new_v7;
///
/// let id = new_v7();
/// assert_eq!(id.get_version_num(), 7);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Check whether a UUID is version 7.
pub fn is_v7(uuid: &Uuid) -> bool {
    uuid.get_version_num() == 7
}

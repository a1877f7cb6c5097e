//! Ledger identifier generation.

use uuid::Uuid;

/// Generates a random identifier rendered as 32 lowercase hex characters.
#[must_use]
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generates a time-ordered identifier (UUID v7) in the same hex form.
///
/// Used where insertion order should be recoverable from the id alone,
/// e.g. checkpoint ids.
#[must_use]
pub fn generate_time_ordered_id() -> String {
    Uuid::now_v7().simple().to_string()
}

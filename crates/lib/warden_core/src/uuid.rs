// Identifiers for users, token ids and refresh-token records.

use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}

/// Generate a new id rendered as a hyphenated string.
pub fn new_id() -> String {
    uuidv7().to_string()
}

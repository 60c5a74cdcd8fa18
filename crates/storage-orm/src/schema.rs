//! ORM view of the shared blob table.
//!
//! The column names, types, and primary key mirror the table that
//! `gridstore-sql` creates; nothing may be added here that the hand-built
//! SQL engine does not also write, or the engines stop being
//! interchangeable.

diesel::table! {
    /// Physical layout shared with the hand-built SQL engine.
    network_blobs (network_id, record_type, key) {
        network_id -> Text,
        #[sql_name = "type"]
        record_type -> Text,
        key -> Text,
        value -> Nullable<Binary>,
        version -> BigInt,
    }
}

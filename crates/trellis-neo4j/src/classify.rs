//! Server error classification
//!
//! The server reports most conditions only as message text, so they are
//! recognized here by substring, in table order.

use trellis_core::StoreError;

use crate::driver::DriverError;

/// Condition recognized in a server message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCondition {
    /// An equivalent index or constraint is already defined
    IndexExists,
    /// Database or schema object already exists
    AlreadyExists,
    /// Database or schema object is missing
    DoesNotExist,
    /// Database is starting, stopping or unroutable
    Unavailable,
    /// Administration command or procedure not available on this server
    NotSupported,
}

const PATTERNS: &[(&str, ServerCondition)] = &[
    ("An equivalent index already exists", ServerCondition::IndexExists),
    ("There already exists an index", ServerCondition::IndexExists),
    ("already exists", ServerCondition::AlreadyExists),
    ("does not exist", ServerCondition::DoesNotExist),
    ("DatabaseNotFound", ServerCondition::DoesNotExist),
    ("There is no such index", ServerCondition::DoesNotExist),
    ("There is no such constraint", ServerCondition::DoesNotExist),
    ("DatabaseUnavailable", ServerCondition::Unavailable),
    ("routing table", ServerCondition::Unavailable),
    ("database is unavailable", ServerCondition::Unavailable),
    ("Unsupported administration command", ServerCondition::NotSupported),
    ("Unknown procedure", ServerCondition::NotSupported),
    ("There is no procedure", ServerCondition::NotSupported),
];

/// First condition whose pattern occurs in `message`
pub fn classify_message(message: &str) -> Option<ServerCondition> {
    PATTERNS
        .iter()
        .find(|(pattern, _)| message.contains(pattern))
        .map(|(_, condition)| *condition)
}

pub fn classify(err: &DriverError) -> Option<ServerCondition> {
    classify_message(&err.full_text())
}

pub fn is_unavailable(err: &DriverError) -> bool {
    err.transient || classify(err) == Some(ServerCondition::Unavailable)
}

pub fn is_already_exists(err: &DriverError) -> bool {
    matches!(
        classify(err),
        Some(ServerCondition::AlreadyExists | ServerCondition::IndexExists)
    )
}

pub fn is_missing(err: &DriverError) -> bool {
    classify(err) == Some(ServerCondition::DoesNotExist)
}

/// Missing database, as opposed to a missing index or constraint
pub fn is_database_missing(err: &DriverError) -> bool {
    let text = err.full_text();
    text.contains("DatabaseNotFound")
        || (is_missing(err) && text.to_lowercase().contains("database"))
}

pub fn is_not_supported(err: &DriverError) -> bool {
    classify(err) == Some(ServerCondition::NotSupported)
}

/// Map a driver error to a store error, keeping availability problems retryable
pub fn to_store_error(context: &str, err: DriverError) -> StoreError {
    if is_unavailable(&err) {
        StoreError::Transient(err.message)
    } else {
        StoreError::server(context, err.message)
    }
}

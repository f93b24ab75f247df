use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of kiosk appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored value could not be encoded as JSON
    #[error("Failed to encode stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

/// Why one persisted feed record was skipped during load.
///
/// Never fatal: the loader logs it and moves on to the next record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("field `{0}` is not a string")]
    WrongType(&'static str),
    #[error("malformed feed id {0:?}")]
    MalformedId(String),
    #[error("duplicate feed id {0}")]
    DuplicateId(Uuid),
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed.
///
/// `id` is fixed at creation and survives renames and url edits. The
/// persisted form is exactly `{"id", "name", "url"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Feed {
    pub id: Uuid,
    pub name: String,
    pub url: String,
}

impl Feed {
    /// Creates a feed with a fresh id.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            url: url.into(),
        }
    }

    /// Rebuilds a feed from one persisted record.
    ///
    /// Ids are accepted in any case (`Uuid::parse_str`), so records written
    /// with upper-case ids load as well.
    pub(crate) fn from_record(record: &Value) -> Result<Self, RecordError> {
        let obj = record.as_object().ok_or(RecordError::NotAnObject)?;

        let raw_id = string_field(obj, "id")?;
        let id = Uuid::parse_str(raw_id).map_err(|_| RecordError::MalformedId(raw_id.to_owned()))?;

        Ok(Self {
            id,
            name: string_field(obj, "name")?.to_owned(),
            url: string_field(obj, "url")?.to_owned(),
        })
    }
}

fn string_field<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a str, RecordError> {
    obj.get(name)
        .ok_or(RecordError::MissingField(name))?
        .as_str()
        .ok_or(RecordError::WrongType(name))
}

//! Storage errors
//!
//! These are the only errors the delivery path refuses to absorb: a failed
//! buffer write means a reading could be lost, so they propagate to the caller.

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite failure (open, write, read, drop)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A buffered row could not be decoded
    #[error("Corrupt row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
}

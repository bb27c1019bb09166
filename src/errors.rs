//! Package errors defines the error variables that may be returned
//! during burrowdb operations.

use std::io;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// Returned when an io operation on the data file failed.
    #[error("io error: {0}")]
    Io(String),

    ///////////////////////////////////////////////////////////////////////////
    // These errors can be returned when opening or calling methods on a DB.
    ///////////////////////////////////////////////////////////////////////////
    /// Returned when a DB instance is accessed before it
    /// is opened or after it is closed.
    #[error("database not open")]
    DatabaseNotOpen,

    /// Returned when opening a database that is already open.
    #[error("database already open")]
    DatabaseOpen,

    /// Returned when both meta pages on a database are invalid.
    /// This typically occurs when a file is not a burrowdb database.
    #[error("invalid database")]
    Invalid,

    /// Returned when the data file was created with a different
    /// version of the format.
    #[error("version mismatch")]
    VersionMismatch,

    /// Returned when either meta page checksum does not match.
    #[error("checksum error")]
    Checksum,

    /// Returned when a database cannot obtain an exclusive lock
    /// on the data file after the timeout passed to open.
    #[error("timeout")]
    Timeout,

    /// Returned when the data file is too short to even hold the
    /// two meta pages.
    #[error("file size too small")]
    FileTooSmall,

    ///////////////////////////////////////////////////////////////////////////
    // These errors can occur when beginning or committing a Tx.
    ///////////////////////////////////////////////////////////////////////////
    /// Returned when performing a write operation on a
    /// read-only transaction.
    #[error("tx not writable")]
    TxNotWritable,

    /// Returned when committing or rolling back a transaction
    /// that has already been committed or rolled back.
    #[error("tx closed")]
    TxClosed,

    /// Returned when a mutating transaction is started on a
    /// read-only database.
    #[error("database is in read-only mode")]
    DatabaseReadOnly,

    ///////////////////////////////////////////////////////////////////////////
    // These errors can occur when putting or deleting a value or a bucket.
    ///////////////////////////////////////////////////////////////////////////
    /// Returned when trying to access a bucket that has
    /// not been created yet.
    #[error("bucket not found")]
    BucketNotFound,

    /// Returned when creating a bucket that already exists.
    #[error("bucket already exists")]
    BucketExists,

    /// Returned when creating a bucket with a blank name.
    #[error("bucket name required")]
    BucketNameRequired,

    /// Returned when inserting a zero-length key.
    #[error("key required")]
    KeyRequired,

    /// Returned when inserting a key that is larger than MAX_KEY_SIZE.
    #[error("key too large")]
    KeyTooLarge,

    /// Returned when inserting a value that is larger than MAX_VALUE_SIZE.
    #[error("value too large")]
    ValueTooLarge,

    /// Returned when trying to create or delete a bucket
    /// on an existing non-bucket key or when trying to create or delete a
    /// non-bucket key on an existing bucket key.
    #[error("incompatible value")]
    IncompatibleValue,
}

impl From<io::Error> for Error {
    #[inline]
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the storage crate.

use thiserror::Error;

pub use extiot_core::Error as ExtIotError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage/Database error.
    #[error("Storage error: {0}")]
    Storage(String),
}

// Every store failure is a store availability problem from the protocol's view.
impl From<Error> for ExtIotError {
    fn from(e: Error) -> Self {
        ExtIotError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(feature = "redb")]
mod redb_conversions {
    use super::Error;

    impl From<redb::Error> for Error {
        fn from(e: redb::Error) -> Self {
            Error::Storage(format!("Redb error: {}", e))
        }
    }

    impl From<redb::TransactionError> for Error {
        fn from(e: redb::TransactionError) -> Self {
            Error::Storage(format!("Redb transaction error: {}", e))
        }
    }

    impl From<redb::TableError> for Error {
        fn from(e: redb::TableError) -> Self {
            Error::Storage(format!("Redb table error: {}", e))
        }
    }

    impl From<redb::StorageError> for Error {
        fn from(e: redb::StorageError) -> Self {
            Error::Storage(format!("Redb storage error: {}", e))
        }
    }

    impl From<redb::CommitError> for Error {
        fn from(e: redb::CommitError) -> Self {
            Error::Storage(format!("Redb commit error: {}", e))
        }
    }

    impl From<redb::DatabaseError> for Error {
        fn from(e: redb::DatabaseError) -> Self {
            Error::Storage(format!("Redb database error: {}", e))
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Storage(format!("Task join error: {}", e))
    }
}

//! Error types for the kvdir block directory

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Lock invalidated: {0}")]
    LockInvalidated(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("End of stream: {0}")]
    EndOfStream(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Already closed: {0}")]
    Closed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, StorageError::Transport(_))
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, StorageError::LockConflict(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StorageError> for std::io::Error {
    fn from(err: StorageError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            StorageError::Io(e) => e.kind(),
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::EndOfStream(_) => ErrorKind::UnexpectedEof,
            StorageError::OutOfRange(_) | StorageError::InvalidArgument(_) => ErrorKind::InvalidInput,
            StorageError::Transport(_) => ErrorKind::ConnectionAborted,
            _ => ErrorKind::Other,
        };
        match err {
            StorageError::Io(e) => e,
            other => std::io::Error::new(kind, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_io_conversion_keeps_kind() {
        let eof: std::io::Error = StorageError::EndOfStream("read past EOF: f".into()).into();
        assert_eq!(eof.kind(), ErrorKind::UnexpectedEof);

        let inner = std::io::Error::new(ErrorKind::PermissionDenied, "lock dir");
        let back: std::io::Error = StorageError::from(inner).into();
        assert_eq!(back.kind(), ErrorKind::PermissionDenied);

        let missing: std::io::Error = StorageError::NotFound("open_input of 'x'".into()).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert!(missing.to_string().contains("'x'"));
    }
}

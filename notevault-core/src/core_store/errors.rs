/*
    errors.rs - Error types for the encrypted file store

    Crypto failures (wrong key, tampering, truncation) and I/O failures are
    always fatal to the single call that hit them. Parse failures are only
    fatal on strict read paths; tolerant reads treat them as "no prior data".
*/

use crate::core_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur in the store subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrong key, tampered or truncated ciphertext
    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    /// Filesystem failure
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed document or index
    #[error("Parse error: {0}")]
    Parse(String),

    /// A logical key component is empty or contains the separator
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Random file name generation kept colliding
    #[error("Could not allocate a unique file name after {0} attempts")]
    NameExhausted(usize),

    /// A thread panicked while holding a store lock
    #[error("Lock poisoned: a thread panicked while holding the lock")]
    LockPoisoned,

    /// An interrupted key rotation must be finished before data is touched
    #[error("A key rotation is pending; rerun it with the same keys to finish")]
    RotationPending,

    /// A blocking worker task failed to complete
    #[error("Worker task failed: {0}")]
    Task(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// True when the failure came from authentication (wrong key or tampering)
    pub fn is_authentication(&self) -> bool {
        matches!(self, StoreError::Crypto(CryptoError::Authentication))
    }
}

impl From<CryptoError> for StoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            // Disk errors surfaced through the streaming codec are still I/O errors
            CryptoError::Io(io) => StoreError::Io(io),
            other => StoreError::Crypto(other),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Parse(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_err: std::sync::PoisonError<T>) -> Self {
        StoreError::LockPoisoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::InvalidKey("kind contains ':'".to_string());
        assert_eq!(err.to_string(), "Invalid key: kind contains ':'");

        let err = StoreError::NameExhausted(16);
        assert!(err.to_string().contains("16 attempts"));
    }

    #[test]
    fn test_crypto_io_becomes_store_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = CryptoError::Io(io).into();
        assert!(matches!(err, StoreError::Io(_)));

        let err: StoreError = CryptoError::Authentication.into();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_slice::<serde_json::Value>(b"{not json").unwrap_err();
        let err: StoreError = json_err.into();
        assert!(matches!(err, StoreError::Parse(_)));
    }
}

//! Error types for the cipher envelope codec

use thiserror::Error;

/// Errors raised while encrypting, decrypting or deriving keys
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Blob is too short to hold an IV (and tag)
    #[error("Ciphertext truncated: {len} bytes")]
    Truncated { len: usize },

    /// Tag mismatch: wrong key, tampered or corrupted data
    #[error("Authentication failed: wrong key or tampered data")]
    Authentication,

    /// Underlying cipher fault
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// Password-based key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Salt could not be parsed
    #[error("Invalid salt: {0}")]
    InvalidSalt(String),

    /// Reading or writing a stream failed
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for codec operations
pub type CryptoResult<T> = Result<T, CryptoError>;

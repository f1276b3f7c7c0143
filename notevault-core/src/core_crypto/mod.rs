//! Cipher envelope codec and master key handling
//!
//! Every byte that reaches the disk (index document and data files) passes
//! through this module. The on-disk envelope is:
//!
//! ```text
//! [IV: 12 bytes][AES-256-GCM ciphertext][tag: 16 bytes]
//! ```

pub mod envelope;
pub mod errors;
pub mod master_key;

pub use envelope::{
    decrypt, decrypt_stream, encrypt, encrypt_stream, EncryptingWriter, DEFAULT_CHUNK_SIZE, IV_LEN,
    TAG_LEN,
};
pub use errors::{CryptoError, CryptoResult};
pub use master_key::{KdfParams, MasterKey, Salt, KEY_LEN, SALT_LEN};

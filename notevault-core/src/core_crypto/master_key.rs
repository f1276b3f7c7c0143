/*
    master_key.rs - The single active symmetric key of a store

    A MasterKey is either generated at random or derived from a user password
    with Argon2id. Key bytes live in a Zeroizing buffer and are wiped on drop.
    Nothing in this module ever formats key material.
*/

use super::errors::{CryptoError, CryptoResult};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// Argon2 salt length (16 bytes = 128 bits)
pub const SALT_LEN: usize = 16;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024, // 19 MiB
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Random salt fed to the password KDF
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    /// Generate a fresh salt from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut bytes);
        Salt(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_LEN]) -> Self {
        Salt(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex-encoded salt; surrounding whitespace is ignored
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidSalt(e.to_string()))?;
        let bytes: [u8; SALT_LEN] = raw.try_into().map_err(|v: Vec<u8>| {
            CryptoError::InvalidSalt(format!("expected {} bytes, got {}", SALT_LEN, v.len()))
        })?;
        Ok(Salt(bytes))
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({})", self.to_hex())
    }
}

/// 256-bit master key used for every envelope of a store
#[derive(Clone)]
pub struct MasterKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl MasterKey {
    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut *bytes);
        MasterKey { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        MasterKey {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Derive a key from a password with Argon2id
    pub fn derive(password: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<Self> {
        let params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("Invalid Argon2 params: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut *bytes)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(MasterKey { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub(crate) fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.bytes[..]))
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes[..].ct_eq(&other.bytes[..]).into()
    }
}

impl Eq for MasterKey {}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_generate_unique() {
        let a = MasterKey::generate();
        let b = MasterKey::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let salt = Salt::generate();
        let a = MasterKey::derive("hunter2", &salt, &fast_params()).unwrap();
        let b = MasterKey::derive("hunter2", &salt, &fast_params()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_depends_on_password_and_salt() {
        let salt = Salt::generate();
        let a = MasterKey::derive("hunter2", &salt, &fast_params()).unwrap();
        let b = MasterKey::derive("hunter3", &salt, &fast_params()).unwrap();
        let c = MasterKey::derive("hunter2", &Salt::generate(), &fast_params()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = KdfParams {
            memory_kib: 1,
            iterations: 0,
            parallelism: 1,
        };
        let result = MasterKey::derive("pw", &Salt::generate(), &params);
        assert!(matches!(result, Err(CryptoError::KeyDerivation(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = MasterKey::from_bytes([0xAB; KEY_LEN]);
        let printed = format!("{:?}", key);
        assert!(!printed.contains("ab"));
        assert!(!printed.contains("171"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_salt_hex_roundtrip() {
        let salt = Salt::generate();
        let parsed = Salt::from_hex(&format!("{}\n", salt.to_hex())).unwrap();
        assert_eq!(salt, parsed);

        assert!(Salt::from_hex("abcd").is_err());
        assert!(Salt::from_hex("not hex").is_err());
    }
}

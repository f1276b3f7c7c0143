//! Salt persistence for password-derived master keys
//!
//! The Argon2id salt is stored hex encoded as `store.salt` in the data
//! directory. A password change stages its new salt as `store.salt.next` and
//! promotes it only after every file is under the new key, so a crash in
//! between still leaves a salt for whichever key the index is under.

use super::atomic::{sync_parent, write_atomic};
use super::errors::StoreResult;
use crate::core_crypto::Salt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SALT_FILE: &str = "store.salt";
pub const STAGED_SALT_FILE: &str = "store.salt.next";

#[derive(Debug, Clone)]
pub(crate) struct SaltFile {
    current: PathBuf,
    staged: PathBuf,
}

impl SaltFile {
    pub fn in_dir(dir: &Path) -> Self {
        SaltFile {
            current: dir.join(SALT_FILE),
            staged: dir.join(STAGED_SALT_FILE),
        }
    }

    /// Current salt, generating and persisting one on first use
    pub fn load_or_create(&self) -> StoreResult<Salt> {
        if let Some(salt) = read_salt(&self.current)? {
            return Ok(salt);
        }
        let salt = Salt::generate();
        write_atomic(&self.current, salt.to_hex().as_bytes())?;
        debug!("Created store salt");
        Ok(salt)
    }

    pub fn staged(&self) -> StoreResult<Option<Salt>> {
        read_salt(&self.staged)
    }

    pub fn stage(&self, salt: &Salt) -> StoreResult<()> {
        write_atomic(&self.staged, salt.to_hex().as_bytes())?;
        Ok(())
    }

    /// Make the staged salt current
    pub fn promote(&self) -> StoreResult<()> {
        fs::rename(&self.staged, &self.current)?;
        sync_parent(&self.current)?;
        debug!("Promoted staged store salt");
        Ok(())
    }
}

fn read_salt(path: &Path) -> StoreResult<Option<Salt>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(Salt::from_hex(text.trim())?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/*
    data_store.rs - Thread-safe access to encrypted documents

    Wraps a FileIndex and the data files it tracks behind two locks:
    - index lock: every index lookup or mutation (short critical sections)
    - content lock: every data file read or write (may cover large I/O)

    A call takes the index lock, resolves the file path, releases it, and only
    then takes the content lock. Only key rotation holds both, and always in
    the order index then content.

    While a rotation journal exists, some files are under the new key and the
    rest under the old one. Reads and writes of documents are refused with
    `RotationPending` until the rotation is rerun; only rotation, removal and
    stats stay available.

    Known window: a `put` that resolved its path just before a concurrent
    `remove` of the same bucket writes a file the index no longer references.
    The document is unreachable (the next `get` allocates a fresh file) and the
    orphan is left on disk.
*/

use super::atomic::{replace_with, write_atomic};
use super::credentials::SaltFile;
use super::errors::{StoreError, StoreResult};
use super::index::{delete_files, FileIndex, RemovalReport, RotationReport};
use super::logical_key::LogicalKey;
use crate::config::StoreConfig;
use crate::core_crypto::{envelope, CryptoError, KdfParams, MasterKey, Salt};
use crate::metrics::Timer;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Summary of the store's current shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub buckets: usize,
    pub entries: usize,
    pub pending_rotation: bool,
}

struct ContentState {
    key: MasterKey,
}

struct StoreInner {
    index: Mutex<FileIndex>,
    content: Mutex<ContentState>,
    chunk_size: usize,
    salts: SaltFile,
    kdf: KdfParams,
}

/// Encrypted document store shared across threads and tasks
///
/// Cloning is cheap and every clone talks to the same index and files.
#[derive(Clone)]
pub struct DataStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("chunk_size", &self.inner.chunk_size)
            .field("kdf", &self.inner.kdf)
            .finish_non_exhaustive()
    }
}

impl DataStore {
    /// Open the store in `config.data_dir` with an explicit master key
    pub fn open(config: &StoreConfig, key: MasterKey) -> StoreResult<Self> {
        let index = FileIndex::open(config, key)?;
        Ok(Self::from_index(config, index, KdfParams::default()))
    }

    /// Open the store with a key derived from `password`
    ///
    /// The salt is read from `store.salt`, created on first open. If a
    /// password change died after the index moved to the new key, the staged
    /// salt is tried next and promoted when it opens the index.
    pub fn open_with_password(
        config: &StoreConfig,
        kdf: &KdfParams,
        password: &str,
    ) -> StoreResult<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let salts = SaltFile::in_dir(&config.data_dir);
        let salt = salts.load_or_create()?;
        let key = MasterKey::derive(password, &salt, kdf)?;

        match FileIndex::open(config, key) {
            Ok(index) => Ok(Self::from_index(config, index, kdf.clone())),
            Err(e) if e.is_authentication() => {
                let staged = match salts.staged()? {
                    Some(staged) => staged,
                    None => return Err(e),
                };
                let key = MasterKey::derive(password, &staged, kdf)?;
                let mut index = FileIndex::open(config, key)?;
                index.clear_finished_rotation()?;
                salts.promote()?;
                info!("Completed interrupted password change");
                Ok(Self::from_index(config, index, kdf.clone()))
            }
            Err(e) => Err(e),
        }
    }

    fn from_index(config: &StoreConfig, index: FileIndex, kdf: KdfParams) -> Self {
        let key = index.key().clone();
        let salts = SaltFile::in_dir(index.data_dir());
        DataStore {
            inner: Arc::new(StoreInner {
                index: Mutex::new(index),
                content: Mutex::new(ContentState { key }),
                chunk_size: config.stream_chunk_size.max(1),
                salts,
                kdf,
            }),
        }
    }

    /// Document for `key`, or `{}` if it was never written or is not valid JSON
    ///
    /// Allocates an index entry on first access. Wrong key, tampering and I/O
    /// failures are still errors.
    pub fn get_blocking(&self, key: &LogicalKey) -> StoreResult<Value> {
        let timer = Timer::new("store.operation.duration_ms");
        let path = self.resolve(key)?;
        counter!("store.operations.read").increment(1);

        let plaintext = match self.read_plaintext(&path)? {
            Some(plaintext) => plaintext,
            None => {
                debug!(key = %key, "No data written yet; returning empty document");
                counter!("store.read.fallback").increment(1);
                timer.stop();
                return Ok(empty_document());
            }
        };

        let value = match serde_json::from_slice(&plaintext) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Stored document is malformed; returning empty document");
                counter!("store.read.fallback").increment(1);
                empty_document()
            }
        };
        timer.stop();
        Ok(value)
    }

    /// Document for `key`, `None` if it was never written
    ///
    /// Unlike [`DataStore::get_blocking`] this never allocates and surfaces
    /// malformed documents as [`StoreError::Parse`].
    pub fn read_blocking(&self, key: &LogicalKey) -> StoreResult<Option<Value>> {
        let path = match self.lookup(key)? {
            Some(path) => path,
            None => return Ok(None),
        };
        counter!("store.operations.read").increment(1);

        match self.read_plaintext(&path)? {
            Some(plaintext) => Ok(Some(serde_json::from_slice(&plaintext)?)),
            None => Ok(None),
        }
    }

    /// Replace the document stored under `key`
    pub fn put_blocking(&self, key: &LogicalKey, value: &Value) -> StoreResult<()> {
        let timer = Timer::new("store.operation.duration_ms");
        let json = serde_json::to_vec(value)?;
        let path = self.resolve(key)?;

        let content = self.inner.content.lock()?;
        let sealed = envelope::encrypt(&content.key, &json)?;
        write_atomic(&path, &sealed)?;
        drop(content);

        counter!("store.operations.write").increment(1);
        counter!("store.bytes.written").increment(sealed.len() as u64);
        debug!(key = %key, bytes = sealed.len(), "Stored document");
        timer.stop();
        Ok(())
    }

    /// Replace the content under `key` with everything `reader` yields
    ///
    /// Encrypts in bounded chunks, so the payload never has to fit in memory.
    /// Returns the number of envelope bytes written.
    pub fn put_stream_blocking<R: Read>(&self, key: &LogicalKey, reader: R) -> StoreResult<u64> {
        let path = self.resolve(key)?;

        let content = self.inner.content.lock()?;
        let mut written = 0u64;
        replace_with(&path, |file| -> StoreResult<()> {
            written = envelope::encrypt_stream(
                &content.key,
                reader,
                BufWriter::new(file),
                self.inner.chunk_size,
            )?;
            Ok(())
        })?;
        drop(content);

        counter!("store.operations.write").increment(1);
        counter!("store.bytes.written").increment(written);
        debug!(key = %key, bytes = written, "Stored stream");
        Ok(written)
    }

    /// Decrypt the content under `key` into `writer`
    ///
    /// Returns `false` if nothing was ever written. Plaintext reaches `writer`
    /// before the tag is checked; on an error the output must be discarded.
    pub fn get_stream_blocking<W: Write>(&self, key: &LogicalKey, writer: W) -> StoreResult<bool> {
        let path = match self.lookup(key)? {
            Some(path) => path,
            None => return Ok(false),
        };

        let content = self.inner.content.lock()?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        envelope::decrypt_stream(&content.key, BufReader::new(file), writer, self.inner.chunk_size)?;
        drop(content);

        counter!("store.operations.read").increment(1);
        Ok(true)
    }

    /// Remove the `(kind, scope)` bucket and delete its data files
    ///
    /// The index is updated first. Files that cannot be deleted are logged
    /// and listed in the report, never raised.
    pub fn remove_blocking(&self, kind: &str, scope: &str) -> StoreResult<RemovalReport> {
        let files = self.inner.index.lock()?.detach_bucket(kind, scope)?;

        let content = self.inner.content.lock()?;
        let report = delete_files(&files);
        drop(content);

        counter!("store.operations.delete").increment(1);
        if !report.failed.is_empty() {
            counter!("store.files.orphaned").increment(report.failed.len() as u64);
        }
        debug!(kind, scope, removed = report.removed, "Removed bucket");
        Ok(report)
    }

    /// Re-encrypt everything from the current key to `new_key`
    pub fn rotate_key_blocking(&self, new_key: MasterKey) -> StoreResult<RotationReport> {
        let mut index = self.inner.index.lock()?;
        let mut content = self.inner.content.lock()?;
        let old_key = content.key.clone();

        let report = index.rotate_key(&old_key, new_key)?;
        content.key = index.key().clone();

        counter!("store.operations.rotate").increment(1);
        Ok(report)
    }

    /// Switch the store to a key derived from `new_password`
    ///
    /// `old_password` must derive the key the index is under. The new salt
    /// is staged before rotating and promoted after, so rerunning with the
    /// same passwords after a crash resumes the rotation.
    pub fn change_password_blocking(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> StoreResult<RotationReport> {
        let salts = &self.inner.salts;
        let kdf = &self.inner.kdf;

        let current = salts.load_or_create()?;
        let old_key = MasterKey::derive(old_password, &current, kdf)?;
        let (staged, fresh) = match salts.staged()? {
            Some(staged) => (staged, false),
            None => (Salt::generate(), true),
        };
        let new_key = MasterKey::derive(new_password, &staged, kdf)?;

        let mut index = self.inner.index.lock()?;
        let mut content = self.inner.content.lock()?;
        // Nothing is staged until the old password is known to be right
        if content.key != old_key {
            return Err(StoreError::Crypto(CryptoError::Authentication));
        }
        if fresh {
            salts.stage(&staged)?;
        }
        let report = index.rotate_key(&old_key, new_key)?;
        content.key = index.key().clone();
        salts.promote()?;
        drop(content);
        drop(index);

        counter!("store.operations.rotate").increment(1);
        info!(rotated = report.rotated, "Password changed");
        Ok(report)
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let index = self.inner.index.lock()?;
        Ok(StoreStats {
            buckets: index.bucket_count(),
            entries: index.entry_count(),
            pending_rotation: index.pending_rotation(),
        })
    }

    /// Directory holding the index and data files
    pub fn data_dir(&self) -> StoreResult<PathBuf> {
        Ok(self.inner.index.lock()?.data_dir().to_path_buf())
    }

    // Async variants: run the blocking sequence on tokio's blocking pool

    pub async fn get(&self, key: LogicalKey) -> StoreResult<Value> {
        let store = self.clone();
        run_blocking(move || store.get_blocking(&key)).await
    }

    pub async fn read(&self, key: LogicalKey) -> StoreResult<Option<Value>> {
        let store = self.clone();
        run_blocking(move || store.read_blocking(&key)).await
    }

    pub async fn put(&self, key: LogicalKey, value: Value) -> StoreResult<()> {
        let store = self.clone();
        run_blocking(move || store.put_blocking(&key, &value)).await
    }

    pub async fn remove(&self, kind: String, scope: String) -> StoreResult<RemovalReport> {
        let store = self.clone();
        run_blocking(move || store.remove_blocking(&kind, &scope)).await
    }

    pub async fn rotate_key(&self, new_key: MasterKey) -> StoreResult<RotationReport> {
        let store = self.clone();
        run_blocking(move || store.rotate_key_blocking(new_key)).await
    }

    pub async fn change_password(
        &self,
        old_password: String,
        new_password: String,
    ) -> StoreResult<RotationReport> {
        let store = self.clone();
        run_blocking(move || store.change_password_blocking(&old_password, &new_password)).await
    }

    fn resolve(&self, key: &LogicalKey) -> StoreResult<PathBuf> {
        let mut index = self.inner.index.lock()?;
        ensure_settled(&index)?;
        index.resolve_or_create(key)
    }

    fn lookup(&self, key: &LogicalKey) -> StoreResult<Option<PathBuf>> {
        let index = self.inner.index.lock()?;
        ensure_settled(&index)?;
        index.lookup(key)
    }

    /// Decrypted content of `path`, `None` if the file does not exist
    fn read_plaintext(&self, path: &Path) -> StoreResult<Option<Vec<u8>>> {
        let content = self.inner.content.lock()?;
        let sealed = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let plaintext = envelope::decrypt(&content.key, &sealed)?;
        Ok(Some(plaintext))
    }
}

fn ensure_settled(index: &FileIndex) -> StoreResult<()> {
    if index.pending_rotation() {
        return Err(StoreError::RotationPending);
    }
    Ok(())
}

fn empty_document() -> Value {
    Value::Object(serde_json::Map::new())
}

async fn run_blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

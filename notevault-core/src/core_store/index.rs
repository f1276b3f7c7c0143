/*
    index.rs - Encrypted index mapping logical keys to data files

    The index is a single JSON document, sealed with the master key and
    rewritten atomically after every mutation:

    {"ids": [{"id": "kind:scope", "data": [{"id": "id:version", "file": "/abs/path"}]}]}

    Data file paths are absolute and always live directly under the data
    directory. Each file name is a random UUID, never derived from the key.
*/

use super::atomic::{self, replace_with, write_atomic};
use super::errors::{StoreError, StoreResult};
use super::journal::RotationJournal;
use super::logical_key::{self, LogicalKey};
use crate::config::StoreConfig;
use crate::core_crypto::{envelope, CryptoError, EncryptingWriter, MasterKey};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at drawing a fresh random file name before giving up
pub const MAX_NAME_ATTEMPTS: usize = 16;

/// Decrypted form of the index file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(default)]
    pub ids: Vec<IndexBucket>,
}

/// All entries sharing one `kind:scope`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBucket {
    pub id: String,
    #[serde(default)]
    pub data: Vec<IndexEntry>,
}

/// One `id:version` and the data file backing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub file: PathBuf,
}

impl IndexDocument {
    pub fn bucket(&self, bucket_id: &str) -> Option<&IndexBucket> {
        self.ids.iter().find(|b| b.id == bucket_id)
    }

    /// Every data file referenced by the index
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.ids
            .iter()
            .flat_map(|b| b.data.iter().map(|e| e.file.as_path()))
    }

    pub fn entry_count(&self) -> usize {
        self.ids.iter().map(|b| b.data.len()).sum()
    }

    fn references_name(&self, name: &str) -> bool {
        self.files().any(|f| f.file_name().map_or(false, |n| n == name))
    }
}

/// Outcome of removing a bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    /// Data files deleted from disk
    pub removed: usize,
    /// Entries whose file had never been written
    pub missing: usize,
    /// Files that could not be deleted and are now orphaned
    pub failed: Vec<PathBuf>,
}

/// Outcome of a key rotation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Files re-encrypted by this call
    pub rotated: usize,
    /// Files an interrupted earlier attempt had already re-encrypted
    pub resumed: usize,
    /// Entries whose file had never been written
    pub missing: usize,
    /// The index itself was already under the new key
    pub index_already_rotated: bool,
}

/// Keyed file index bound to one data directory and master key
pub struct FileIndex {
    data_dir: PathBuf,
    index_path: PathBuf,
    extension: String,
    chunk_size: usize,
    key: MasterKey,
    document: IndexDocument,
}

impl FileIndex {
    /// Open (or start) the index in `config.data_dir`
    ///
    /// A missing index file is an empty index. An index that fails to
    /// decrypt or parse is an error: the key is wrong or the file is damaged.
    pub fn open(config: &StoreConfig, key: MasterKey) -> StoreResult<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let data_dir = fs::canonicalize(&config.data_dir)?;
        let index_path = data_dir.join(&config.index_file);

        let swept = atomic::sweep_temp_files(&data_dir)?;
        if swept > 0 {
            info!(count = swept, "Removed temp files left by an interrupted write");
        }

        if RotationJournal::exists_in(&data_dir) {
            warn!(
                dir = %data_dir.display(),
                "Found an interrupted key rotation; rerun it with the same keys to finish"
            );
        }

        let document = load_document(&index_path, &key)?.unwrap_or_default();
        debug!(
            buckets = document.ids.len(),
            entries = document.entry_count(),
            "Opened file index"
        );

        Ok(FileIndex {
            data_dir,
            index_path,
            extension: config.data_extension.clone(),
            chunk_size: config.stream_chunk_size.max(1),
            key,
            document,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn document(&self) -> &IndexDocument {
        &self.document
    }

    pub(crate) fn key(&self) -> &MasterKey {
        &self.key
    }

    /// Composite `kind:scope` keys of every bucket
    pub fn buckets(&self) -> Vec<String> {
        self.document.ids.iter().map(|b| b.id.clone()).collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.document.ids.len()
    }

    pub fn entry_count(&self) -> usize {
        self.document.entry_count()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.document.files().map(Path::to_path_buf).collect()
    }

    /// True while a rotation journal sits in the data directory
    pub fn pending_rotation(&self) -> bool {
        RotationJournal::exists_in(&self.data_dir)
    }

    /// Drop a leftover journal once the index is known to open with the new key
    ///
    /// The index is rewritten after every data file, so at that point only
    /// the journal cleanup can be missing.
    pub(crate) fn clear_finished_rotation(&mut self) -> StoreResult<()> {
        if self.pending_rotation() {
            RotationJournal::open(&self.data_dir)?.clear()?;
            info!("Finished interrupted key rotation");
        }
        Ok(())
    }

    /// Path of the file backing `key`, if one has been allocated
    pub fn lookup(&self, key: &LogicalKey) -> StoreResult<Option<PathBuf>> {
        key.validate()?;
        Ok(self.find(&key.bucket_key(), &key.entry_key()))
    }

    /// Path of the file backing `key`, allocating and persisting one if needed
    ///
    /// Idempotent: once allocated, the same key always yields the same path.
    /// The file itself is not created.
    pub fn resolve_or_create(&mut self, key: &LogicalKey) -> StoreResult<PathBuf> {
        self.resolve_or_create_with(key, random_name)
    }

    fn resolve_or_create_with<G>(&mut self, key: &LogicalKey, generate: G) -> StoreResult<PathBuf>
    where
        G: FnMut(&str) -> String,
    {
        key.validate()?;
        let bucket_id = key.bucket_key();
        let entry_id = key.entry_key();

        if let Some(path) = self.find(&bucket_id, &entry_id) {
            return Ok(path);
        }

        let name = self.allocate_name(generate)?;
        let path = self.data_dir.join(&name);

        let (pos, new_bucket) = match self.document.ids.iter().position(|b| b.id == bucket_id) {
            Some(pos) => (pos, false),
            None => {
                self.document.ids.push(IndexBucket {
                    id: bucket_id,
                    data: Vec::new(),
                });
                (self.document.ids.len() - 1, true)
            }
        };
        self.document.ids[pos].data.push(IndexEntry {
            id: entry_id,
            file: path.clone(),
        });

        if let Err(e) = self.persist() {
            // Keep memory in step with what is on disk
            if new_bucket {
                self.document.ids.remove(pos);
            } else {
                self.document.ids[pos].data.pop();
            }
            return Err(e);
        }

        debug!(key = %key, file = %name, "Allocated data file");
        Ok(path)
    }

    /// Drop the `(kind, scope)` bucket from the index and delete its files
    ///
    /// The index is rewritten first, so a crash can orphan files but never
    /// leave the index pointing at deleted ones. File deletion is best effort.
    pub fn remove_bucket(&mut self, kind: &str, scope: &str) -> StoreResult<RemovalReport> {
        let files = self.detach_bucket(kind, scope)?;
        Ok(delete_files(&files))
    }

    /// Drop the `(kind, scope)` bucket from the index, returning its files
    ///
    /// An unknown bucket is not an error and yields no files.
    pub fn detach_bucket(&mut self, kind: &str, scope: &str) -> StoreResult<Vec<PathBuf>> {
        let bucket_id = logical_key::bucket_key(kind, scope)?;

        let pos = match self.document.ids.iter().position(|b| b.id == bucket_id) {
            Some(pos) => pos,
            None => return Ok(Vec::new()),
        };

        let bucket = self.document.ids.remove(pos);
        if let Err(e) = self.persist() {
            self.document.ids.insert(pos, bucket);
            return Err(e);
        }

        debug!(bucket = %bucket_id, entries = bucket.data.len(), "Detached bucket");
        Ok(bucket.data.into_iter().map(|e| e.file).collect())
    }

    /// Re-encrypt the index and every data file from `old` to `new`
    ///
    /// Each data file is replaced atomically and its name journaled once it
    /// is under `new`. The index is rewritten last and the journal removed
    /// after it. If the process dies midway, calling this again with the
    /// same pair of keys skips journaled files that already open with `new`
    /// and finishes the job.
    /// On error the index keeps `old` and the journal stays on disk.
    pub fn rotate_key(&mut self, old: &MasterKey, new: MasterKey) -> StoreResult<RotationReport> {
        let mut report = RotationReport::default();
        let resuming = RotationJournal::exists_in(&self.data_dir);

        let document = match load_document(&self.index_path, old) {
            Ok(doc) => doc.unwrap_or_else(|| self.document.clone()),
            Err(e) if e.is_authentication() && resuming => {
                // Only the journal cleanup was lost: the index is rewritten last
                let document = load_document(&self.index_path, &new)?.unwrap_or_default();
                RotationJournal::open(&self.data_dir)?.clear()?;
                self.document = document;
                self.key = new;
                report.index_already_rotated = true;
                info!("Finished interrupted key rotation");
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        let mut journal = RotationJournal::open(&self.data_dir)?;
        if resuming {
            info!(done = journal.len(), "Resuming key rotation");
        }

        for path in document.files() {
            let name = file_name_of(path);
            if journal.contains(&name) {
                if !path.exists() || verifies(path, &new, self.chunk_size) {
                    report.resumed += 1;
                    continue;
                }
                if !verifies(path, old, self.chunk_size) {
                    warn!(file = %name, "Journaled file does not open with the new key; the earlier rotation used a different key");
                    return Err(StoreError::Crypto(CryptoError::Authentication));
                }
                // Rewritten under the old key after it was journaled
                debug!(file = %name, "Journaled file is back under the old key; rotating again");
                rotate_file(path, old, &new, self.chunk_size)?;
                report.rotated += 1;
                continue;
            }
            if !path.exists() {
                report.missing += 1;
                continue;
            }

            match rotate_file(path, old, &new, self.chunk_size) {
                Ok(()) => report.rotated += 1,
                // Replaced on disk but killed before the journal line landed
                Err(e) if e.is_authentication() && resuming && verifies(path, &new, self.chunk_size) => {
                    report.resumed += 1;
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "Key rotation stopped; rerun to resume");
                    return Err(e);
                }
            }
            journal.record(&name)?;
        }

        write_document(&self.index_path, &document, &new)?;
        journal.clear()?;

        self.document = document;
        self.key = new;

        info!(
            rotated = report.rotated,
            resumed = report.resumed,
            missing = report.missing,
            "Key rotation complete"
        );
        Ok(report)
    }

    fn find(&self, bucket_id: &str, entry_id: &str) -> Option<PathBuf> {
        self.document
            .bucket(bucket_id)?
            .data
            .iter()
            .find(|e| e.id == entry_id)
            .map(|e| e.file.clone())
    }

    fn allocate_name<G>(&self, mut generate: G) -> StoreResult<String>
    where
        G: FnMut(&str) -> String,
    {
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let name = generate(&self.extension);
            let taken = name == file_name_of(&self.index_path)
                || self.document.references_name(&name)
                || self.data_dir.join(&name).exists();
            if !taken {
                return Ok(name);
            }
            warn!(attempt, name = %name, "Generated file name is taken; retrying");
        }
        Err(StoreError::NameExhausted(MAX_NAME_ATTEMPTS))
    }

    fn persist(&self) -> StoreResult<()> {
        write_document(&self.index_path, &self.document, &self.key)
    }
}

fn random_name(extension: &str) -> String {
    format!("{}.{}", Uuid::new_v4().simple(), extension)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn load_document(path: &Path, key: &MasterKey) -> StoreResult<Option<IndexDocument>> {
    let sealed = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let plaintext = envelope::decrypt(key, &sealed)?;
    Ok(Some(serde_json::from_slice(&plaintext)?))
}

fn write_document(path: &Path, document: &IndexDocument, key: &MasterKey) -> StoreResult<()> {
    let json = serde_json::to_vec(document)?;
    let sealed = envelope::encrypt(key, &json)?;
    write_atomic(path, &sealed)?;
    Ok(())
}

/// Best-effort deletion; failures are logged and reported, never raised
pub(crate) fn delete_files(files: &[PathBuf]) -> RemovalReport {
    let mut report = RemovalReport::default();
    for file in files {
        match fs::remove_file(file) {
            Ok(()) => report.removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => report.missing += 1,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Could not delete data file");
                report.failed.push(file.clone());
            }
        }
    }
    report
}

/// Replace `path` with its content re-sealed under `new`
fn rotate_file(path: &Path, old: &MasterKey, new: &MasterKey, chunk_size: usize) -> StoreResult<()> {
    let source = BufReader::new(File::open(path)?);
    replace_with(path, |file| -> StoreResult<()> {
        let mut sealed = EncryptingWriter::new(new, BufWriter::new(file))?;
        envelope::decrypt_stream(old, source, &mut sealed, chunk_size)?;
        sealed.finish()?.into_inner().map_err(|e| e.into_error())?;
        Ok(())
    })
}

fn verifies(path: &Path, key: &MasterKey, chunk_size: usize) -> bool {
    File::open(path)
        .map_err(StoreError::from)
        .and_then(|f| Ok(envelope::decrypt_stream(key, BufReader::new(f), io::sink(), chunk_size)?))
        .is_ok()
}

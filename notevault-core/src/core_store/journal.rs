//! Rotation journal
//!
//! Lists the data files already re-encrypted under the new key during a key
//! rotation, one file name per line. It exists only while a rotation is in
//! flight: created before the first file is touched, removed after the index
//! itself has been rewritten. A journal found on disk therefore means a
//! rotation was interrupted and has to be resumed with the same key pair.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE: &str = "rotation.journal";

pub(crate) struct RotationJournal {
    path: PathBuf,
    completed: HashSet<String>,
    file: File,
}

impl RotationJournal {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(JOURNAL_FILE)
    }

    pub fn exists_in(dir: &Path) -> bool {
        Self::path_in(dir).exists()
    }

    /// Open the journal in `dir`, loading any entries from an earlier attempt
    pub fn open(dir: &Path) -> io::Result<Self> {
        let path = Self::path_in(dir);

        let mut completed = HashSet::new();
        if path.exists() {
            for line in BufReader::new(File::open(&path)?).lines() {
                let line = line?;
                let name = line.trim();
                if !name.is_empty() {
                    completed.insert(name.to_string());
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.sync_all()?;

        Ok(RotationJournal {
            path,
            completed,
            file,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.completed.contains(name)
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    /// Durably record that `name` is now under the new key
    pub fn record(&mut self, name: &str) -> io::Result<()> {
        writeln!(self.file, "{}", name)?;
        self.file.sync_data()?;
        self.completed.insert(name.to_string());
        Ok(())
    }

    /// Remove the journal once the rotation is complete
    pub fn clear(self) -> io::Result<()> {
        let RotationJournal { path, file, .. } = self;
        drop(file);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_survives_reopen() {
        let dir = TempDir::new().unwrap();

        let mut journal = RotationJournal::open(dir.path()).unwrap();
        assert!(RotationJournal::exists_in(dir.path()));
        journal.record("a.enc").unwrap();
        journal.record("b.enc").unwrap();
        drop(journal);

        let journal = RotationJournal::open(dir.path()).unwrap();
        assert_eq!(journal.len(), 2);
        assert!(journal.contains("a.enc"));
        assert!(!journal.contains("c.enc"));
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let journal = RotationJournal::open(dir.path()).unwrap();
        journal.clear().unwrap();
        assert!(!RotationJournal::exists_in(dir.path()));
    }
}

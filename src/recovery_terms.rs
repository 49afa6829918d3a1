//! Per-queue recovery terms, persisted across clean shutdowns.
//!
//! The store is a process-wide collaborator keyed by queue directory
//! name. At `terminate` each queue records its per-segment unacked
//! counts (plus any caller extras); at the next start the walker reads
//! the terms back and clears the store, so that a later crash is
//! detected as a dirty shutdown. The on-disk form is a single JSON file
//! in the queues directory, replaced atomically.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::layout::queues_dir;
use crate::{Error, Result};

pub const RECOVERY_TERMS_FILENAME: &str = "recovery.terms";

/// Terms one queue persisted at its last clean shutdown.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueTerms {
    /// `(segment number, unacked count)` for every segment the index
    /// knew about when it terminated.
    pub segments: Vec<(u64, u64)>,
    /// Caller-supplied keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What `recover` is handed for one queue.
#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryTerms {
    /// No terms found: the previous shutdown was not clean.
    NonClean,
    Clean(QueueTerms),
}

impl RecoveryTerms {
    pub fn is_clean(&self) -> bool {
        matches!(self, RecoveryTerms::Clean(_))
    }
}

pub struct RecoveryTermsStore {
    path: PathBuf,
    terms: Mutex<HashMap<String, QueueTerms>>,
}

impl RecoveryTermsStore {
    /// Open the store for a broker data directory, loading any terms
    /// persisted under its queues tree. A terms file that does not
    /// decode is [`Error::CorruptTerms`]; a missing file just means
    /// nothing shut down cleanly.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = queues_dir(data_dir).join(RECOVERY_TERMS_FILENAME);
        let terms = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(RecoveryTermsStore {
            path,
            terms: Mutex::new(terms),
        })
    }

    pub fn read(&self, dir_name: &str) -> Result<Option<QueueTerms>> {
        let terms = self
            .terms
            .lock()
            .map_err(|_| Error::LockPoisoned("recovery terms"))?;
        Ok(terms.get(dir_name).cloned())
    }

    pub fn store(&self, dir_name: &str, queue_terms: QueueTerms) -> Result<()> {
        let mut terms = self
            .terms
            .lock()
            .map_err(|_| Error::LockPoisoned("recovery terms"))?;
        terms.insert(dir_name.to_string(), queue_terms);
        Ok(())
    }

    /// Forget everything, in memory and on disk. Called once the terms
    /// have been read back at startup.
    pub fn clear(&self) -> Result<()> {
        let mut terms = self
            .terms
            .lock()
            .map_err(|_| Error::LockPoisoned("recovery terms"))?;
        terms.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist the current terms and close the store. Written to a
    /// sibling temp file and renamed into place so a crash mid-write
    /// leaves either the old terms or none.
    pub fn stop(self) -> Result<()> {
        let terms = self
            .terms
            .lock()
            .map_err(|_| Error::LockPoisoned("recovery terms"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(&*terms)?;
        let tmp = self.path.with_extension("terms.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_through_stop_and_open() {
        let dir = tempdir().expect("tempdir");
        let store = RecoveryTermsStore::open(dir.path()).expect("open");
        let mut extra = serde_json::Map::new();
        extra.insert("persistent_ref".into(), serde_json::json!("abc123"));
        store
            .store(
                "qdir",
                QueueTerms {
                    segments: vec![(0, 2), (3, 0)],
                    extra,
                },
            )
            .expect("store");
        store.stop().expect("stop");

        let store = RecoveryTermsStore::open(dir.path()).expect("reopen");
        let terms = store.read("qdir").expect("read").expect("present");
        assert_eq!(terms.segments, vec![(0, 2), (3, 0)]);
        assert_eq!(
            terms.extra.get("persistent_ref"),
            Some(&serde_json::json!("abc123"))
        );
        assert_eq!(store.read("other").expect("read"), None);
    }

    #[test]
    fn clear_removes_file() {
        let dir = tempdir().expect("tempdir");
        let terms_path = queues_dir(dir.path()).join(RECOVERY_TERMS_FILENAME);
        let store = RecoveryTermsStore::open(dir.path()).expect("open");
        store
            .store("qdir", QueueTerms::default())
            .expect("store");
        store.stop().expect("stop");
        assert!(terms_path.exists());

        let store = RecoveryTermsStore::open(dir.path()).expect("reopen");
        store.clear().expect("clear");
        assert!(!terms_path.exists());
        assert_eq!(store.read("qdir").expect("read"), None);
    }

    #[test]
    fn corrupt_terms_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let queues = queues_dir(dir.path());
        fs::create_dir_all(&queues).expect("mkdir");
        fs::write(queues.join(RECOVERY_TERMS_FILENAME), b"not json").expect("write");
        assert!(matches!(
            RecoveryTermsStore::open(dir.path()),
            Err(Error::CorruptTerms(_))
        ));
    }
}

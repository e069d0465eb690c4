//! Lock-guarded JSON document persistence
//!
//! Each document is held in memory behind a mutex. A mutation runs against a
//! copy, the copy is written to disk atomically (temp file + rename), and only
//! then replaces the in-memory version. Concurrent updates are serialised by
//! the mutex, so no read-modify-write cycle can lose another one's changes.

use modelplay_common::error::{ModelPlayError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A whole JSON document with serialised, durable updates
#[derive(Debug)]
pub struct DocumentStore<T> {
    /// `None` keeps the document in memory only
    path: Option<PathBuf>,
    doc: Mutex<T>,
}

impl<T> DocumentStore<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    /// Open the document at `path`, starting from `T::default()` if the file
    /// does not exist yet.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let content = std::fs::read(&path)?;
            let doc = serde_json::from_slice(&content).map_err(|e| {
                ModelPlayError::internal(format!("Corrupt document {}: {}", path.display(), e))
            })?;
            info!("Loaded document {}", path.display());
            doc
        } else {
            debug!("Document {} does not exist yet, starting empty", path.display());
            T::default()
        };

        Ok(Self {
            path: Some(path),
            doc: Mutex::new(doc),
        })
    }

    /// Document that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(T::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the current document
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.doc.lock())
    }

    /// Copy of the current document
    pub fn snapshot(&self) -> T {
        self.doc.lock().clone()
    }

    /// Apply `f` and persist the result.
    ///
    /// If `f` fails or the write fails, the document is left untouched.
    ///
    /// The write and rename happen synchronously while the lock is held, so
    /// the file on disk always matches the last committed document. Async
    /// callers block their runtime thread for that long; the documents are a
    /// few KiB and updates only happen on control operations, never per
    /// inference request.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guard = self.doc.lock();
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        self.persist(&draft)?;
        *guard = draft;
        Ok(out)
    }

    fn persist(&self, doc: &T) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

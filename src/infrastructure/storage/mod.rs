//! File-based plugin state persistence

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::application::errors::StorageError;

/// Default state shape: an arbitrary JSON mapping
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// JSON-serializable state bound to a single file
pub struct PersistedState<T = JsonMap> {
    path: PathBuf,
    data: Mutex<T>,
    /// Held for a whole save, from serializing to the final rename
    save_lock: Mutex<()>,
}

impl<T> PersistedState<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Bind state to `path` and load whatever is there
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let state = Self {
            path: path.into(),
            data: Mutex::new(T::default()),
            save_lock: Mutex::new(()),
        };
        state.load();
        state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace in-memory state with the file contents.
    ///
    /// A missing file yields empty state silently; an unreadable or malformed
    /// one yields empty state with a warning.
    pub fn load(&self) {
        let loaded = match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Ignoring malformed state file {}: {}", self.path.display(), e);
                    T::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => {
                tracing::warn!("Failed to read state file {}: {}", self.path.display(), e);
                T::default()
            }
        };
        *self.lock() = loaded;
    }

    /// Write the full state to disk.
    ///
    /// Writes a sibling temp file, flushes and syncs it, then renames it over
    /// the destination so a crash never leaves a truncated file behind.
    /// Concurrent saves of the same state run one at a time; the last one to
    /// finish carries the newest data.
    pub fn save(&self) -> Result<(), StorageError> {
        let _saving = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let json = {
            let data = self.lock();
            serde_json::to_vec_pretty(&*data)?
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        let written = Self::write_file(&tmp, &json).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::debug!("Saved state to {}", self.path.display());
        Ok(())
    }

    fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Read access to the state
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate the state in memory. Call [`save`](Self::save) to persist.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }

    /// Mutate the state and persist it immediately
    pub fn update_and_save<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StorageError> {
        let result = self.update(f);
        self.save()?;
        Ok(result)
    }
}

impl<T: Clone> PersistedState<T> {
    /// Copy of the current state
    pub fn snapshot(&self) -> T {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

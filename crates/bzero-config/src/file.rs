//! Host-file backend: one file, atomic replace, advisory locking.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;

use crate::backend::{Backend, Record};
use crate::error::{ConfigError, ConfigResult};

/// Stores the record as a single file. Writes go to a temp file in the same
/// directory followed by a rename, so readers never observe a torn record.
/// A sibling `.lock` file carries the advisory lock that serializes
/// cross-process fetch/save on host installations.
pub struct FileBackend<T> {
    path: PathBuf,
    lock_path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> FileBackend<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock(&self) -> ConfigResult<fs::File> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Fetch(e.to_string()))?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| ConfigError::Fetch(e.to_string()))
    }
}

#[async_trait]
impl<T: Record> Backend<T> for FileBackend<T> {
    async fn fetch(&self) -> ConfigResult<T> {
        let path = self.path.clone();
        let lock = self.open_lock()?;
        let bytes = tokio::task::spawn_blocking(move || -> ConfigResult<Vec<u8>> {
            lock.lock_shared().map_err(|e| ConfigError::Fetch(e.to_string()))?;
            let result = match fs::read(&path) {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(ConfigError::Fetch(e.to_string())),
            };
            let _ = lock.unlock();
            result
        })
        .await
        .map_err(|e| ConfigError::Fetch(e.to_string()))??;
        T::decode(&bytes)
    }

    async fn save(&self, record: &T) -> ConfigResult<()> {
        let bytes = record.encode()?;
        let path = self.path.clone();
        let lock = self.open_lock()?;
        tokio::task::spawn_blocking(move || -> ConfigResult<()> {
            lock.lock_exclusive().map_err(|e| ConfigError::Save(e.to_string()))?;
            let result = write_atomic(&path, &bytes);
            let _ = lock.unlock();
            result
        })
        .await
        .map_err(|e| ConfigError::Save(e.to_string()))?
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> ConfigResult<()> {
    let dir = path.parent().ok_or_else(|| ConfigError::Save("config path has no parent".into()))?;
    fs::create_dir_all(dir).map_err(|e| ConfigError::Save(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ConfigError::Save(e.to_string()))?;
    tmp.write_all(bytes).map_err(|e| ConfigError::Save(e.to_string()))?;
    tmp.flush().map_err(|e| ConfigError::Save(e.to_string()))?;
    tmp.persist(path).map_err(|e| ConfigError::Save(e.to_string()))?;
    Ok(())
}

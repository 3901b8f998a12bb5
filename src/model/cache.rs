//! Persistent on-disk store for downloaded model blobs.

use std::io::ErrorKind;
use std::path::PathBuf;

use tokio::fs;

use crate::error::{Error, Result};

/// Manages the model cache directory.
///
/// Each key maps to one file. Writes go through a temporary file and a rename
/// so a crash mid-write never leaves a truncated model behind.
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a cache in the platform-appropriate directory:
    /// - Windows: `%LOCALAPPDATA%\lamafill\models`
    /// - Linux: `~/.cache/lamafill/models`
    /// - macOS: `~/Library/Caches/lamafill/models`
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new() -> Result<Self> {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::at(base.join("lamafill").join("models"))
    }

    /// Create a cache rooted at `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn at<P: Into<PathBuf>>(cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.into();

        std::fs::create_dir_all(&cache_dir).map_err(|source| Error::CacheDir {
            path: cache_dir.clone(),
            source,
        })?;

        Ok(Self { cache_dir })
    }

    /// File backing `key`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.cache_dir.join(file_name(key))
    }

    /// Read the blob stored under `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on any I/O failure other than not-found.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(storage(key, source)),
        }
    }

    /// Store `blob` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the blob cannot be written.
    pub async fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let temp_path = self.cache_dir.join(format!("{}.part", file_name(key)));

        fs::write(&temp_path, blob)
            .await
            .map_err(|source| storage(key, source))?;

        // Atomic rename
        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(storage(key, source));
        }

        tracing::debug!("Cached {} bytes under {key}", blob.len());
        Ok(())
    }

    /// Remove the blob stored under `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but cannot be removed.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(storage(key, source)),
        }
    }

    /// Whether a blob is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the cache cannot be inspected.
    pub async fn contains(&self, key: &str) -> Result<bool> {
        fs::try_exists(self.path_for(key))
            .await
            .map_err(|source| storage(key, source))
    }
}

fn storage(key: &str, source: std::io::Error) -> Error {
    Error::Storage {
        key: key.to_string(),
        source,
    }
}

/// Map a cache key onto a single safe file name.
fn file_name(key: &str) -> String {
    let name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() || name.chars().all(|c| c == '.') {
        format!("_{name}")
    } else {
        name
    }
}

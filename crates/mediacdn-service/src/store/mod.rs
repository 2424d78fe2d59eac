//! The filesystem object store of the edge node.
//!
//! Objects live at `root/series/type/filename`. Every write first goes to a staging file inside
//! `root/.tmp` and is then renamed into place, so a reader only ever observes complete payloads:
//! either the previous version of an object, or the new one.
//!
//! When a size bound is configured, an [`LruIndex`](lru::LruIndex) tracks the resident objects
//! and the least recently used ones are evicted after each write.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::EdgeConfig;
use crate::types::{ObjectKey, STAGING_DIR};

mod cleanup;
mod lru;

pub use cleanup::cleanup;

use self::lru::LruIndex;

/// An error returned by [`ObjectStore`] operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The key is not resident in the store.
    #[error("object not found in store")]
    NotFound,
    /// Any other filesystem failure.
    #[error("object store i/o error")]
    Io(#[source] Arc<io::Error>),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Maps a [`io::ErrorKind::NotFound`] to [`StoreError::NotFound`].
fn not_found_or_io(err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound
    } else {
        err.into()
    }
}

/// A resident object opened for reading.
#[derive(Debug)]
pub struct StoredObject {
    pub file: tokio::fs::File,
    pub path: PathBuf,
    pub len: u64,
    pub modified: SystemTime,
}

#[derive(Debug)]
struct StoreInner {
    root: PathBuf,
    tmp_dir: PathBuf,
    index: Option<Mutex<LruIndex>>,
}

/// A key→bytes store on top of a directory tree.
///
/// This is cheap to clone and can be shared across request handlers.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    inner: Arc<StoreInner>,
}

impl ObjectStore {
    /// Opens the store at `root`, creating the directory if needed.
    ///
    /// With a `max_size`, the resident objects are indexed right away so that the bound also
    /// covers objects that were stored by a previous process.
    pub fn open(root: impl Into<PathBuf>, max_size: Option<u64>) -> io::Result<Self> {
        let root = root.into();
        let tmp_dir = root.join(STAGING_DIR);
        std::fs::create_dir_all(&tmp_dir)?;

        let index = match max_size {
            Some(max_size) => {
                let mut index = LruIndex::new(max_size);
                let count = index.populate(&root)?;
                tracing::info!(
                    count,
                    total_size = index.total_size(),
                    max_size,
                    "Indexed resident objects"
                );
                Some(Mutex::new(index))
            }
            None => None,
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                tmp_dir,
                index,
            }),
        })
    }

    pub fn from_config(config: &EdgeConfig) -> io::Result<Self> {
        Self::open(&config.cache_dir, config.max_cache_size)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn path(&self, key: &ObjectKey) -> PathBuf {
        key.path_in(&self.inner.root)
    }

    /// Whether `key` is resident, i.e. a regular file exists at its location.
    pub async fn exists(&self, key: &ObjectKey) -> bool {
        tokio::fs::metadata(self.path(key))
            .await
            .is_ok_and(|metadata| metadata.is_file())
    }

    /// Writes `contents` under `key`, replacing any previous object.
    ///
    /// Returns the number of bytes written. If anything fails, the staging file is discarded and
    /// the previous object (if any) is left untouched.
    pub async fn write<S>(&self, key: &ObjectKey, contents: S) -> Result<u64, StoreError>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let temp_file = self.tempfile()?;
        let mut file = tokio::fs::File::from_std(temp_file.reopen()?);

        let mut contents = std::pin::pin!(contents);
        let mut written = 0u64;
        while let Some(chunk) = contents.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        let store = self.clone();
        let owned_key = key.clone();
        tokio::task::spawn_blocking(move || store.commit(temp_file, &owned_key, written))
            .await
            .map_err(io::Error::other)??;
        tracing::trace!(%key, written, "Stored object");

        Ok(written)
    }

    /// Opens the object stored under `key`.
    pub async fn read_stream(&self, key: &ObjectKey) -> Result<StoredObject, StoreError> {
        let path = self.path(key);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(not_found_or_io)?;
        let metadata = file.metadata().await.map_err(not_found_or_io)?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound);
        }

        if let Some(index) = &self.inner.index {
            index.lock().unwrap_or_else(|e| e.into_inner()).touch(key);
        }

        Ok(StoredObject {
            file,
            path,
            len: metadata.len(),
            modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
        })
    }

    /// Removes the object stored under `key`.
    pub async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let path = self.path(key);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(not_found_or_io)?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound);
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(not_found_or_io)?;

        if let Some(index) = &self.inner.index {
            index.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        }
        Ok(())
    }

    /// Clears the staging directory.
    ///
    /// This needs to happen on startup, to get rid of staging files that survived a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        let tmp = &self.inner.tmp_dir;
        if tmp.exists() {
            std::fs::remove_dir_all(tmp)?;
        }
        std::fs::create_dir_all(tmp)
    }

    /// Evicts least recently used objects until the store fits its size bound.
    ///
    /// Returns the number of evicted objects. Without a bound, this does nothing. This blocks on
    /// the filesystem.
    pub fn enforce_size_bound(&self) -> usize {
        let Some(index) = &self.inner.index else {
            return 0;
        };
        let mut index = index.lock().unwrap_or_else(|e| e.into_inner());
        let evicted = index.evict(None);
        self.remove_evicted(&evicted);
        evicted.len()
    }

    /// Moves a finished staging file into place and applies the size bound.
    ///
    /// With a bound, the rename, the index update and the evictions all happen under the index
    /// lock. An object chosen for eviction thus cannot be rewritten before its file is removed.
    fn commit(&self, temp_file: NamedTempFile, key: &ObjectKey, size: u64) -> io::Result<()> {
        let path = self.path(key);
        let Some(index) = &self.inner.index else {
            return persist_tempfile(temp_file, &path);
        };

        let mut index = index.lock().unwrap_or_else(|e| e.into_inner());
        persist_tempfile(temp_file, &path)?;
        index.record(key.clone(), size);
        let evicted = index.evict(Some(key));
        self.remove_evicted(&evicted);
        Ok(())
    }

    fn remove_evicted(&self, evicted: &[ObjectKey]) {
        for key in evicted {
            match std::fs::remove_file(self.path(key)) {
                Ok(()) => tracing::debug!(%key, "Evicted object"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(%key, error = &e as &dyn std::error::Error, "Failed to evict object")
                }
            }
        }
        if !evicted.is_empty() {
            metric!(counter("edge.cache.evicted") += evicted.len() as i64);
        }
    }

    /// Creates a new staging file.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        let path = &self.inner.tmp_dir;
        // `cleanup` may remove the staging directory underneath us, so retry once.
        const MAX_RETRIES: usize = 1;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(path) {
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    if retries > MAX_RETRIES {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to create staging file: {:?}", e),
                        );
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Moves a finished staging file to its final location, creating parent directories.
fn persist_tempfile(temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist object"))?;

    if let Err(e) = std::fs::create_dir_all(parent) {
        sentry::with_scope(
            |scope| scope.set_extra("path", parent.display().to_string().into()),
            || tracing::error!("Failed to create object directory: {:?}", e),
        );
        return Err(e);
    }

    // On failure the returned `NamedTempFile` is dropped, which removes the staging file.
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

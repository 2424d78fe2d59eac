//! Recency and size bookkeeping for a size-bounded store.
//!
//! The index is in-memory only. It is rebuilt from disk when the store is opened, using each
//! file's mtime as its initial recency, and afterwards kept in sync by the store operations.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use lru::LruCache;
use walkdir::WalkDir;

use crate::types::{ObjectKey, STAGING_DIR};

#[derive(Debug)]
pub(super) struct LruIndex {
    entries: LruCache<ObjectKey, u64>,
    total_size: u64,
    max_size: u64,
}

impl LruIndex {
    pub fn new(max_size: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_size: 0,
            max_size,
        }
    }

    /// Indexes all objects resident below `root`, oldest first.
    ///
    /// Files which do not map to a valid [`ObjectKey`] are skipped.
    pub fn populate(&mut self, root: &Path) -> io::Result<usize> {
        let mut found: Vec<(SystemTime, ObjectKey, u64)> = Vec::new();

        let walker = WalkDir::new(root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == STAGING_DIR));

        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = key_from_path(root, entry.path()) else {
                tracing::debug!("Skipping unaddressable file {}", entry.path().display());
                continue;
            };
            let metadata = entry.metadata().map_err(io::Error::other)?;
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((mtime, key, metadata.len()));
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        let count = found.len();
        for (_, key, size) in found {
            self.record(key, size);
        }
        Ok(count)
    }

    /// Records a (re-)written object as the most recently used one.
    pub fn record(&mut self, key: ObjectKey, size: u64) {
        if let Some(old_size) = self.entries.put(key, size) {
            self.total_size -= old_size;
        }
        self.total_size += size;
    }

    /// Marks an object as used.
    pub fn touch(&mut self, key: &ObjectKey) {
        self.entries.get(key);
    }

    pub fn remove(&mut self, key: &ObjectKey) {
        if let Some(size) = self.entries.pop(key) {
            self.total_size -= size;
        }
    }

    /// Drops least recently used entries until the total size fits the bound.
    ///
    /// `keep` is never evicted, even if it alone exceeds the bound. The caller is responsible for
    /// deleting the returned objects from disk.
    pub fn evict(&mut self, keep: Option<&ObjectKey>) -> Vec<ObjectKey> {
        let mut evicted = Vec::new();
        while self.total_size > self.max_size {
            let Some((key, size)) = self.entries.pop_lru() else {
                break;
            };
            if Some(&key) == keep {
                self.entries.put(key, size);
                // `keep` was the least recently used entry, which means it is the only one left
                // that could be evicted
                if self.entries.len() == 1 {
                    break;
                }
                continue;
            }
            self.total_size -= size;
            evicted.push(key);
        }
        evicted
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn key_from_path(root: &Path, path: &Path) -> Option<ObjectKey> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.iter().map(|c| c.to_str());
    let series = components.next()??;
    let ty = components.next()??;
    let filename = components.next()??;
    ObjectKey::new(series, ty, filename).ok()
}

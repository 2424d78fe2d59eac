use std::fs::{read_dir, remove_dir};
use std::io;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::EdgeConfig;
use crate::types::STAGING_DIR;

use super::ObjectStore;

/// Entry function for the cleanup command.
///
/// Clears the staging directory, evicts objects beyond the configured size bound and prunes
/// directories left empty by invalidations or evictions.
/// If `dry_run` is `true`, nothing is deleted.
pub fn cleanup(config: &EdgeConfig, dry_run: bool) -> Result<()> {
    let root = &config.cache_dir;
    if dry_run {
        let store = ObjectStore::open(root, None).context("failed to open object store")?;
        let empty = prune_empty_dirs(store.root(), true)?;
        tracing::info!(empty_dirs = empty, "Would remove empty directories");
        return Ok(());
    }

    let store = ObjectStore::from_config(config).context("failed to open object store")?;
    store
        .clear_tmp()
        .context("failed to clear staging directory")?;

    let evicted = store.enforce_size_bound();
    let empty = prune_empty_dirs(store.root(), false)?;
    tracing::info!(evicted, empty_dirs = empty, "Cleaned up object store");
    Ok(())
}

/// Removes empty series and type directories, returning how many were (or would be) removed.
fn prune_empty_dirs(root: &Path, dry_run: bool) -> io::Result<usize> {
    let mut removed = 0;
    for series in read_dir(root)? {
        let series = series?;
        if series.file_name() == STAGING_DIR || !series.file_type()?.is_dir() {
            continue;
        }

        let mut remaining = 0;
        for ty in read_dir(series.path())? {
            let ty = ty?;
            if ty.file_type()?.is_dir() && read_dir(ty.path())?.next().is_none() {
                if !dry_run {
                    remove_dir(ty.path())?;
                }
                removed += 1;
            } else {
                remaining += 1;
            }
        }

        if remaining == 0 {
            if !dry_run {
                remove_dir(series.path())?;
            }
            removed += 1;
        }
    }
    Ok(removed)
}

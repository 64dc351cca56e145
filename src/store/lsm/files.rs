//! On-disk layout of a database directory and reference-counted file retention.
//!
//! ```text
//! <dir>/LOCK
//! <dir>/MANIFEST
//! <dir>/wal/000007.wal
//! <dir>/sst/000042.sst
//! ```
//!
//! Files that leave the live set (flushed WAL segments, compacted tables) go
//! through [`FileRegistry::delete_obsolete`]. A file pinned by a
//! [`LiveFiles`] handle is only unlinked when the last pin is released.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::manifest::{LevelMeta, TableMeta};

pub const LOCK_FILE: &str = "LOCK";
pub const MANIFEST_FILE: &str = "MANIFEST";
pub const WAL_DIR: &str = "wal";
pub const SST_DIR: &str = "sst";

const WAL_EXT: &str = "wal";
const SST_EXT: &str = "sst";

pub fn wal_dir(dir: &Path) -> PathBuf {
    dir.join(WAL_DIR)
}

pub fn sst_dir(dir: &Path) -> PathBuf {
    dir.join(SST_DIR)
}

pub fn wal_path(dir: &Path, id: u64) -> PathBuf {
    wal_dir(dir).join(wal_file_name(id))
}

pub fn sst_path(dir: &Path, id: u64) -> PathBuf {
    sst_dir(dir).join(sst_file_name(id))
}

pub fn wal_file_name(id: u64) -> String {
    format!("{id:06}.{WAL_EXT}")
}

pub fn sst_file_name(id: u64) -> String {
    format!("{id:06}.{SST_EXT}")
}

/// Parses `000042.sst` style names; `None` for anything else.
pub fn parse_file_id(path: &Path, ext: &str) -> Option<u64> {
    if path.extension()?.to_str()? != ext {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Ids of every `*.<ext>` file in `dir`, sorted. Other entries are returned
/// separately so callers can remove leftovers such as temp files.
pub fn list_files(dir: &Path, ext: &str) -> std::io::Result<(Vec<(u64, PathBuf)>, Vec<PathBuf>)> {
    let mut ids = Vec::new();
    let mut others = Vec::new();
    if !dir.exists() {
        return Ok((ids, others));
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        match parse_file_id(&path, ext) {
            Some(id) => ids.push((id, path)),
            None => others.push(path),
        }
    }
    ids.sort_by_key(|(id, _)| *id);
    Ok((ids, others))
}

pub fn list_wals(dir: &Path) -> std::io::Result<(Vec<(u64, PathBuf)>, Vec<PathBuf>)> {
    list_files(&wal_dir(dir), WAL_EXT)
}

pub fn list_ssts(dir: &Path) -> std::io::Result<(Vec<(u64, PathBuf)>, Vec<PathBuf>)> {
    list_files(&sst_dir(dir), SST_EXT)
}

pub(crate) fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Default)]
struct Registry {
    pins: HashMap<PathBuf, usize>,
    deferred: HashSet<PathBuf>,
}

/// Pin counts for files that must outlive their removal from the live set.
#[derive(Debug, Default)]
pub struct FileRegistry {
    inner: Mutex<Registry>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        for path in paths {
            *inner.pins.entry(path.to_path_buf()).or_insert(0) += 1;
        }
    }

    pub fn unpin<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) {
        let mut release = Vec::new();
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            for path in paths {
                let Some(count) = inner.pins.get_mut(path) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 {
                    inner.pins.remove(path);
                    if inner.deferred.remove(path) {
                        release.push(path.to_path_buf());
                    }
                }
            }
        }
        for path in release {
            Self::unlink(&path);
        }
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.pins.contains_key(path))
            .unwrap_or(false)
    }

    /// Deletes `path` now, or when its last pin is released.
    pub fn delete_obsolete(&self, path: &Path) {
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.pins.contains_key(path) {
                debug!(path = %path.display(), "Deferring deletion of pinned file");
                inner.deferred.insert(path.to_path_buf());
                return;
            }
        }
        Self::unlink(path);
    }

    pub fn deferred_count(&self) -> usize {
        self.inner.lock().map(|i| i.deferred.len()).unwrap_or(0)
    }

    fn unlink(path: &Path) {
        match remove_file_if_exists(path) {
            Ok(()) => debug!(path = %path.display(), "Deleted obsolete file"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete obsolete file"),
        }
    }
}

/// A WAL segment captured by [`LiveFiles`], valid up to `len` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveWal {
    pub id: u64,
    pub path: PathBuf,
    pub len: u64,
}

/// A consistent, pinned view of the files making up the database.
///
/// Tables are immutable and WAL segments only grow, so copying every table
/// in full and every WAL up to its captured length reproduces the database
/// as of `last_sequence`. The files stay on disk until the handle drops.
#[derive(Debug)]
pub struct LiveFiles {
    pub tables: Vec<TableMeta>,
    pub levels: Vec<LevelMeta>,
    pub wals: Vec<LiveWal>,
    pub last_sequence: u64,
    pub next_table_id: u64,
    /// Highest WAL id whose contents are already in tables.
    pub flushed_wal_id: u64,
    pub dir: PathBuf,
    registry: Arc<FileRegistry>,
    pinned: Vec<PathBuf>,
}

impl LiveFiles {
    pub(crate) fn new(
        dir: PathBuf,
        levels: Vec<LevelMeta>,
        wals: Vec<LiveWal>,
        last_sequence: u64,
        next_table_id: u64,
        flushed_wal_id: u64,
        registry: Arc<FileRegistry>,
    ) -> Self {
        let tables: Vec<TableMeta> = levels.iter().flat_map(|l| l.tables.clone()).collect();
        let pinned: Vec<PathBuf> = tables
            .iter()
            .map(|t| sst_path(&dir, t.id))
            .chain(wals.iter().map(|w| w.path.clone()))
            .collect();
        registry.pin(pinned.iter().map(PathBuf::as_path));
        Self {
            tables,
            levels,
            wals,
            last_sequence,
            next_table_id,
            flushed_wal_id,
            dir,
            registry,
            pinned,
        }
    }

    pub fn table_path(&self, id: u64) -> PathBuf {
        sst_path(&self.dir, id)
    }

    pub fn total_size(&self) -> u64 {
        self.tables.iter().map(|t| t.size).sum::<u64>() + self.wals.iter().map(|w| w.len).sum::<u64>()
    }
}

impl Drop for LiveFiles {
    fn drop(&mut self) {
        self.registry.unpin(self.pinned.iter().map(PathBuf::as_path));
    }
}

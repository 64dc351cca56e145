//! Incremental, verifiable backups of a live [`Engine`].
//!
//! # Layout
//!
//! ```text
//! <backup_dir>/
//!   meta/<id>.json                      one document per generation
//!   shared/<table>_<crc>_<size>.sst     tables, shared between generations
//!   private/<id>/<segment>.wal          WAL prefixes owned by one generation
//! ```
//!
//! Tables are immutable, so a table already present in `shared/` from an
//! earlier generation is referenced instead of copied again. WAL segments
//! still grow and are copied per generation, up to the length captured with
//! the rest of the file set.
//!
//! A generation moves through `Enumerating → Copying → Finalizing →
//! Verifying → Complete`; any failure (or cancellation) records it as
//! `Failed` and removes its private files. Earlier generations are never
//! touched.

pub mod copy;
pub mod meta;
mod restore;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::BackupOptions;
use crate::error::Result;
use crate::store::lsm::files::{self, LiveFiles, LiveWal};
use crate::store::lsm::{Engine, TableMeta};
use crate::Error;

use copy::{copy_file, verify_file};
pub use meta::{BackupFile, BackupId, BackupMeta, BackupState, FileKind};

const META_DIR: &str = "meta";
const SHARED_DIR: &str = "shared";
const PRIVATE_DIR: &str = "private";

/// Summary of a completed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub id: BackupId,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    /// Bytes referenced by the generation, shared files included.
    pub size: u64,
    pub file_count: usize,
    pub last_sequence: u64,
}

impl From<&BackupMeta> for BackupInfo {
    fn from(meta: &BackupMeta) -> Self {
        Self {
            id: meta.id,
            timestamp: meta.timestamp,
            size: meta.size(),
            file_count: meta.files.len(),
            last_sequence: meta.last_sequence,
        }
    }
}

/// Requests that the running backup stop before its next file.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct BackupEngine {
    options: BackupOptions,
    backups: Mutex<BTreeMap<BackupId, BackupMeta>>,
    /// Serializes operations that write to the backup directory.
    op_lock: Mutex<()>,
    cancelled: Arc<AtomicBool>,
}

impl BackupEngine {
    /// Opens the backup directory, creating it if needed. Generations left
    /// in progress by a crash are marked failed.
    pub fn open(options: BackupOptions) -> Result<Self> {
        options.validate()?;
        let root = options.backup_dir.clone();
        for dir in [META_DIR, SHARED_DIR, PRIVATE_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }

        let mut backups = BTreeMap::new();
        for mut meta in meta::load_all(&root)? {
            if meta.state.is_in_progress() {
                warn!(backup_id = meta.id, state = ?meta.state, "Marking interrupted backup as failed");
                meta.state = BackupState::Failed;
                meta.error = Some("interrupted".into());
                meta::save(&root, &meta, options.sync)?;
                remove_dir_if_exists(&private_dir(&root, meta.id))?;
            }
            backups.insert(meta.id, meta);
        }

        info!(
            dir = %root.display(),
            generations = backups.len(),
            "Opened backup engine"
        );
        Ok(Self {
            options,
            backups: Mutex::new(backups),
            op_lock: Mutex::new(()),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn root(&self) -> &Path {
        &self.options.backup_dir
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    /// Copies a point-in-time view of `engine` into a new generation.
    /// Foreground writes to the engine continue while files are copied.
    pub fn create_new_backup(&self, engine: &Engine) -> Result<BackupId> {
        let _op = self.op_lock.lock()?;
        let id = self
            .backups
            .lock()?
            .keys()
            .next_back()
            .map_or(1, |last| last + 1);
        let mut meta = BackupMeta::new(id);
        info!(backup_id = id, db = %engine.dir().display(), "Starting backup");

        match self.run_backup(engine, &mut meta) {
            Ok(()) => {
                info!(
                    backup_id = id,
                    files = meta.files.len(),
                    bytes = meta.size(),
                    last_sequence = meta.last_sequence,
                    "Backup complete"
                );
                self.backups.lock()?.insert(id, meta);
                Ok(id)
            }
            Err(e) => {
                warn!(backup_id = id, state = ?meta.state, error = %e, "Backup failed");
                meta.state = BackupState::Failed;
                meta.error = Some(e.to_string());
                if let Err(cleanup) = remove_dir_if_exists(&private_dir(self.root(), id)) {
                    warn!(backup_id = id, error = %cleanup, "Failed to remove private backup files");
                }
                if let Err(save) = meta::save(self.root(), &meta, self.options.sync) {
                    warn!(backup_id = id, error = %save, "Failed to record backup failure");
                }
                self.backups.lock()?.insert(id, meta);
                Err(e)
            }
        }
    }

    fn run_backup(&self, engine: &Engine, meta: &mut BackupMeta) -> Result<()> {
        let root = self.root();
        let sync = self.options.sync;
        meta::save(root, meta, sync)?;

        let live = engine.live_files(self.options.flush_before_backup)?;
        meta.last_sequence = live.last_sequence;
        meta.next_table_id = live.next_table_id;
        meta.flushed_wal_id = live.flushed_wal_id;
        meta.levels = live.levels.clone();
        debug!(
            backup_id = meta.id,
            tables = live.tables.len(),
            wals = live.wals.len(),
            bytes = live.total_size(),
            "Captured live files"
        );

        meta.state = BackupState::Copying;
        meta::save(root, meta, sync)?;
        for table in &live.tables {
            self.check_cancelled()?;
            let file = self.copy_table(&live, table)?;
            meta.files.push(file);
        }
        if !live.wals.is_empty() {
            fs::create_dir_all(private_dir(root, meta.id))?;
        }
        for wal in &live.wals {
            self.check_cancelled()?;
            let file = self.copy_wal(meta.id, wal)?;
            meta.files.push(file);
        }
        drop(live);

        meta.state = BackupState::Finalizing;
        meta::save(root, meta, sync)?;

        meta.state = BackupState::Verifying;
        for file in &meta.files {
            let path = root.join(&file.path);
            let size = fs::metadata(&path)
                .map_err(|_| Error::MissingFile(path.clone()))?
                .len();
            if size != file.size {
                return Err(Error::SizeMismatch {
                    path,
                    expected: file.size,
                    actual: size,
                });
            }
        }

        meta.state = BackupState::Complete;
        meta::save(root, meta, sync)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.swap(false, Ordering::SeqCst) {
            return Err(Error::Aborted("backup cancelled".into()));
        }
        Ok(())
    }

    fn copy_table(&self, live: &LiveFiles, table: &TableMeta) -> Result<BackupFile> {
        let relative = Path::new(SHARED_DIR).join(format!(
            "{}_{}_{}.sst",
            table.id, table.checksum, table.size
        ));
        let dst = self.root().join(&relative);

        if dst.exists() {
            debug!(table_id = table.id, "Table already backed up");
        } else {
            let src = live.table_path(table.id);
            let (size, checksum) = copy_file(&src, &dst, None, self.options.sync)?;
            let mismatch = if size != table.size {
                Some(Error::SizeMismatch {
                    path: src,
                    expected: table.size,
                    actual: size,
                })
            } else if checksum != table.checksum {
                Some(Error::ChecksumMismatch {
                    path: src,
                    expected: table.checksum,
                    actual: checksum,
                })
            } else {
                None
            };
            if let Some(e) = mismatch {
                fs::remove_file(&dst)?;
                return Err(e);
            }
        }

        Ok(BackupFile {
            kind: FileKind::Table,
            id: table.id,
            path: relative,
            size: table.size,
            checksum: table.checksum,
        })
    }

    fn copy_wal(&self, backup_id: BackupId, wal: &LiveWal) -> Result<BackupFile> {
        let relative = Path::new(PRIVATE_DIR)
            .join(backup_id.to_string())
            .join(files::wal_file_name(wal.id));
        let dst = self.root().join(&relative);
        let (size, checksum) = copy_file(&wal.path, &dst, Some(wal.len), self.options.sync)?;
        if size != wal.len {
            return Err(Error::SizeMismatch {
                path: wal.path.clone(),
                expected: wal.len,
                actual: size,
            });
        }
        Ok(BackupFile {
            kind: FileKind::Wal,
            id: wal.id,
            path: relative,
            size,
            checksum,
        })
    }

    /// Completed generations, oldest first.
    pub fn get_backup_info(&self) -> Result<Vec<BackupInfo>> {
        Ok(self
            .backups
            .lock()?
            .values()
            .filter(|m| m.state == BackupState::Complete)
            .map(BackupInfo::from)
            .collect())
    }

    /// Ids of generations that did not complete.
    pub fn failed_backups(&self) -> Result<Vec<BackupId>> {
        Ok(self
            .backups
            .lock()?
            .values()
            .filter(|m| m.state == BackupState::Failed)
            .map(|m| m.id)
            .collect())
    }

    fn complete_meta(&self, id: BackupId) -> Result<BackupMeta> {
        match self.backups.lock()?.get(&id) {
            Some(meta) if meta.state == BackupState::Complete => Ok(meta.clone()),
            Some(meta) => Err(Error::InvalidState(format!(
                "backup {id} is {:?}",
                meta.state
            ))),
            None => Err(Error::NotFound(format!("backup {id}"))),
        }
    }

    /// Re-reads every file of the generation and checks its size and CRC-64.
    /// The error names the first file that fails.
    pub fn verify_backup(&self, id: BackupId) -> Result<()> {
        let meta = self.complete_meta(id)?;
        for file in &meta.files {
            verify_file(&self.root().join(&file.path), file.size, file.checksum)?;
        }
        debug!(backup_id = id, files = meta.files.len(), "Verified backup");
        Ok(())
    }

    /// Recreates the database of generation `id` in `target`, which must be
    /// empty or absent. The result opens with [`Engine::open`].
    pub fn restore_db_from_backup(&self, id: BackupId, target: impl AsRef<Path>) -> Result<()> {
        let _op = self.op_lock.lock()?;
        let meta = self.complete_meta(id)?;
        self.verify_backup(id)?;
        restore::restore(self.root(), &meta, target.as_ref(), self.options.sync)
    }

    /// Deletes a generation and every shared file only it referenced.
    pub fn delete_backup(&self, id: BackupId) -> Result<()> {
        let _op = self.op_lock.lock()?;
        self.delete_generation(id)?;
        self.collect_garbage()?;
        Ok(())
    }

    /// Keeps the `keep` newest completed generations and deletes the rest.
    /// Returns how many were deleted.
    pub fn purge_old_backups(&self, keep: usize) -> Result<usize> {
        let _op = self.op_lock.lock()?;
        let complete: Vec<BackupId> = self
            .backups
            .lock()?
            .values()
            .filter(|m| m.state == BackupState::Complete)
            .map(|m| m.id)
            .collect();
        let purge = complete.len().saturating_sub(keep);
        for &id in &complete[..purge] {
            self.delete_generation(id)?;
        }
        if purge > 0 {
            self.collect_garbage()?;
            info!(purged = purge, kept = keep, "Purged old backups");
        }
        Ok(purge)
    }

    /// Removes shared files no completed generation references, temp files,
    /// and private data of failed generations. Returns the number of entries
    /// removed.
    pub fn garbage_collect(&self) -> Result<usize> {
        let _op = self.op_lock.lock()?;
        self.collect_garbage()
    }

    fn delete_generation(&self, id: BackupId) -> Result<()> {
        if self.backups.lock()?.remove(&id).is_none() {
            return Err(Error::NotFound(format!("backup {id}")));
        }
        files::remove_file_if_exists(&meta::meta_path(self.root(), id))?;
        remove_dir_if_exists(&private_dir(self.root(), id))?;
        info!(backup_id = id, "Deleted backup");
        Ok(())
    }

    fn collect_garbage(&self) -> Result<usize> {
        let root = self.root();
        let (referenced, live_private): (HashSet<PathBuf>, HashSet<String>) = {
            let backups = self.backups.lock()?;
            let complete = backups.values().filter(|m| m.state == BackupState::Complete);
            let referenced = complete
                .clone()
                .flat_map(|m| m.files.iter().map(move |f| root.join(&f.path)))
                .collect();
            let live_private = complete.map(|m| m.id.to_string()).collect();
            (referenced, live_private)
        };

        let mut removed = 0;
        for entry in fs::read_dir(root.join(SHARED_DIR))? {
            let path = entry?.path();
            if !referenced.contains(&path) {
                debug!(path = %path.display(), "Removing unreferenced backup file");
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        for entry in fs::read_dir(root.join(PRIVATE_DIR))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !live_private.contains(&name) {
                debug!(path = %entry.path().display(), "Removing stray private backup data");
                let path = entry.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn private_dir(root: &Path, id: BackupId) -> PathBuf {
    root.join(PRIVATE_DIR).join(id.to_string())
}

fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Options, ReadOptions, WriteOptions};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: PathBuf,
        backups: PathBuf,
        restore: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                db: dir.path().join("db"),
                backups: dir.path().join("backups"),
                restore: dir.path().join("restore"),
                _dir: dir,
            }
        }

        fn engine(&self) -> Engine {
            Engine::open(Options::new(&self.db)).unwrap()
        }

        fn backup_engine(&self) -> BackupEngine {
            BackupEngine::open(BackupOptions::new(&self.backups)).unwrap()
        }
    }

    fn shared_files(fx: &Fixture) -> usize {
        fs::read_dir(fx.backups.join(SHARED_DIR)).unwrap().count()
    }

    #[test]
    fn test_incremental_backups_share_tables() -> Result<()> {
        let fx = Fixture::new();
        let engine = fx.engine();
        let backups = fx.backup_engine();
        let w = WriteOptions::default();

        engine.put(&w, "a", "1")?;
        let first = backups.create_new_backup(&engine)?;
        assert_eq!(shared_files(&fx), 1);

        engine.put(&w, "b", "2")?;
        let second = backups.create_new_backup(&engine)?;
        assert_eq!(shared_files(&fx), 2, "first table is referenced, not copied");

        let info = backups.get_backup_info()?;
        assert_eq!(info.iter().map(|i| i.id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(info[1].last_sequence, 2);
        assert!(info[1].size > info[0].size);
        Ok(())
    }

    #[test]
    fn test_restore_without_flush_replays_wal() -> Result<()> {
        let fx = Fixture::new();
        let engine = fx.engine();
        let backups =
            BackupEngine::open(BackupOptions::new(&fx.backups).flush_before_backup(false))?;
        let w = WriteOptions::default();

        engine.put(&w, "flushed", "table")?;
        engine.flush()?;
        engine.put(&w, "pending", "wal")?;
        let id = backups.create_new_backup(&engine)?;
        engine.put(&w, "later", "excluded")?;

        backups.restore_db_from_backup(id, &fx.restore)?;
        let restored = Engine::open(Options::new(&fx.restore))?;
        let r = ReadOptions::default();
        assert_eq!(restored.get(&r, b"flushed")?, Some(b"table".to_vec()));
        assert_eq!(restored.get(&r, b"pending")?, Some(b"wal".to_vec()));
        assert_eq!(restored.get(&r, b"later")?, None);
        Ok(())
    }

    #[test]
    fn test_restore_refuses_non_empty_target() -> Result<()> {
        let fx = Fixture::new();
        let engine = fx.engine();
        let backups = fx.backup_engine();
        engine.put(&WriteOptions::default(), "k", "v")?;
        let id = backups.create_new_backup(&engine)?;

        let err = backups.restore_db_from_backup(id, &fx.db).unwrap_err();
        assert!(matches!(err, Error::Busy(_)), "live database is locked: {err:?}");

        fs::create_dir_all(&fx.restore)?;
        fs::write(fx.restore.join("unrelated"), b"x")?;
        let err = backups.restore_db_from_backup(id, &fx.restore).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(matches!(
            backups.restore_db_from_backup(99, fx.restore.join("x")),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_cancelled_backup_is_failed() -> Result<()> {
        let fx = Fixture::new();
        let engine = fx.engine();
        let backups = fx.backup_engine();
        engine.put(&WriteOptions::default(), "k", "v")?;
        let good = backups.create_new_backup(&engine)?;

        backups.cancel_handle().cancel();
        let err = backups.create_new_backup(&engine).unwrap_err();
        assert!(matches!(err, Error::Aborted(_)));

        assert_eq!(backups.get_backup_info()?.len(), 1);
        assert_eq!(backups.failed_backups()?, vec![good + 1]);
        assert!(!private_dir(&fx.backups, good + 1).exists());
        backups.verify_backup(good)?;
        assert!(matches!(
            backups.verify_backup(good + 1),
            Err(Error::InvalidState(_))
        ));

        // The flag is consumed by the cancelled run.
        backups.create_new_backup(&engine)?;
        Ok(())
    }

    #[test]
    fn test_interrupted_backup_marked_failed_on_open() -> Result<()> {
        let fx = Fixture::new();
        drop(fx.backup_engine());

        let mut meta = BackupMeta::new(5);
        meta.state = BackupState::Copying;
        meta::save(&fx.backups, &meta, false)?;
        fs::create_dir_all(private_dir(&fx.backups, 5))?;

        let backups = fx.backup_engine();
        assert_eq!(backups.failed_backups()?, vec![5]);
        assert!(backups.get_backup_info()?.is_empty());
        assert!(!private_dir(&fx.backups, 5).exists());
        assert_eq!(meta::load(&fx.backups, 5)?.state, BackupState::Failed);
        Ok(())
    }

    #[test]
    fn test_purge_and_garbage_collect() -> Result<()> {
        let fx = Fixture::new();
        let engine = fx.engine();
        let backups = fx.backup_engine();
        let w = WriteOptions::default();

        for i in 0..3 {
            engine.put(&w, format!("key{i}"), "v")?;
            backups.create_new_backup(&engine)?;
        }
        // Merging the three tables leaves later generations nothing to share.
        engine.compact_all()?;
        let newest = backups.create_new_backup(&engine)?;
        assert_eq!(shared_files(&fx), 4);

        fs::write(fx.backups.join(SHARED_DIR).join("9_9_9.sst.tmp"), b"partial")?;
        assert_eq!(backups.purge_old_backups(1)?, 3);
        assert_eq!(shared_files(&fx), 1);
        assert_eq!(backups.get_backup_info()?.len(), 1);
        backups.verify_backup(newest)?;

        backups.delete_backup(newest)?;
        assert_eq!(shared_files(&fx), 0);
        assert!(matches!(backups.delete_backup(newest), Err(Error::NotFound(_))));
        assert_eq!(backups.garbage_collect()?, 0);
        Ok(())
    }
}

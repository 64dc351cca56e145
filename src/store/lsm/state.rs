use std::{
    collections::VecDeque,
    ops::Bound,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, RwLock,
    },
    time::Duration,
};

use super::compaction::Reservations;
use super::files::FileRegistry;
use super::flush::FlushQueue;
use super::iterator::EntryIterator;
use super::manifest::{Level, LevelMeta, Manifest, SSTable};
use super::memtable::{ActiveMemtable, FrozenMemtable};
use super::snapshot::SnapshotList;
use crate::error::Result;
use crate::Error;

/// Number of levels in the tree, L0 included.
pub const NUM_LEVELS: usize = 7;

/// An immutable level layout. Installing a flush or compaction produces a
/// new `Version`; readers keep whichever one they cloned.
#[derive(Debug, Clone)]
pub struct Version {
    pub levels: Vec<Level>,
}

impl Default for Version {
    fn default() -> Self {
        Self::new()
    }
}

impl Version {
    pub fn new() -> Self {
        Self {
            levels: (0..NUM_LEVELS as u32).map(Level::new).collect(),
        }
    }

    pub fn level(&self, level: u32) -> &Level {
        &self.levels[level as usize]
    }

    pub fn l0_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Level::len).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.levels.iter().map(Level::size).sum()
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<SSTable>> {
        self.levels.iter().flat_map(|l| l.sstables.iter())
    }

    pub fn level_metas(&self) -> Vec<LevelMeta> {
        self.levels
            .iter()
            .map(|l| LevelMeta {
                level: l.level_num,
                tables: l.metas(),
            })
            .collect()
    }

    /// Newest version of `key` at or below `seq`: L0 newest first, then one
    /// candidate table per deeper level.
    pub fn get(&self, key: &[u8], seq: u64) -> Result<Option<Option<Vec<u8>>>> {
        for sstable in self.levels[0].sstables.iter().rev() {
            if !sstable.meta.contains_key(key) {
                continue;
            }
            if let Some(value) = sstable.table.get(key, seq)? {
                return Ok(Some(value));
            }
        }
        for level in &self.levels[1..] {
            if let Some(sstable) = level.find_table(key) {
                if let Some(value) = sstable.table.get(key, seq)? {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// One source per table, newest data first.
    pub fn iterators(&self, start: &Bound<Vec<u8>>, end: &Bound<Vec<u8>>) -> Vec<EntryIterator> {
        let l0 = self.levels[0].sstables.iter().rev();
        let deeper = self.levels[1..].iter().flat_map(|l| l.sstables.iter());
        l0.chain(deeper)
            .filter(|t| in_range(&t.meta.min_key, &t.meta.max_key, start, end))
            .map(|t| Box::new(t.table.iter(start.clone(), end.clone())) as EntryIterator)
            .collect()
    }

    pub fn with_flush(&self, sstable: Arc<SSTable>) -> Version {
        let mut version = self.clone();
        version.levels[0].add_sstable(sstable);
        version
    }

    pub fn with_compaction(
        &self,
        deleted: &[u64],
        target_level: u32,
        added: Vec<Arc<SSTable>>,
    ) -> Version {
        let mut version = self.clone();
        for level in &mut version.levels {
            level.remove_sstables(deleted);
        }
        for sstable in added {
            version.levels[target_level as usize].add_sstable(sstable);
        }
        version
    }
}

fn in_range(min: &[u8], max: &[u8], start: &Bound<Vec<u8>>, end: &Bound<Vec<u8>>) -> bool {
    let after_start = match start {
        Bound::Included(s) => max >= s.as_slice(),
        Bound::Excluded(s) => max > s.as_slice(),
        Bound::Unbounded => true,
    };
    let before_end = match end {
        Bound::Included(e) => min <= e.as_slice(),
        Bound::Excluded(e) => min < e.as_slice(),
        Bound::Unbounded => true,
    };
    after_start && before_end
}

/// Everything a reader needs, cloned under one short read lock.
#[derive(Debug, Clone)]
pub struct Current {
    pub active: ActiveMemtable,
    /// Oldest first.
    pub frozen: VecDeque<FrozenMemtable>,
    pub version: Arc<Version>,
}

/// All mutable state of the engine with fine-grained locking.
pub struct LsmState {
    pub dir: PathBuf,

    // Read path
    pub current: RwLock<Current>,

    // Write path: the single append point
    pub write_lock: Mutex<()>,
    /// Highest sequence visible to readers.
    pub last_sequence: AtomicU64,

    // Metadata
    pub manifest: Mutex<Manifest>,
    pub next_table_id: AtomicU64,
    pub next_wal_id: AtomicU64,
    pub next_job_id: AtomicU64,
    pub flushed_wal_id: AtomicU64,

    // Background coordination
    pub flushes: Mutex<FlushQueue>,
    pub reservations: Mutex<Reservations>,
    pub running_flushes: AtomicUsize,
    pub running_compactions: AtomicUsize,
    pub shutting_down: AtomicBool,
    bg_error: Mutex<Option<String>>,

    // Write stall signalling
    stall_lock: Mutex<()>,
    stall_cv: Condvar,

    pub snapshots: Arc<SnapshotList>,
    pub files: Arc<FileRegistry>,
}

pub struct LsmStateInit {
    pub dir: PathBuf,
    pub current: Current,
    pub manifest: Manifest,
    pub last_sequence: u64,
    pub next_table_id: u64,
    pub next_wal_id: u64,
    pub flushed_wal_id: u64,
}

impl LsmState {
    pub fn new(init: LsmStateInit) -> Self {
        Self {
            dir: init.dir,
            current: RwLock::new(init.current),
            write_lock: Mutex::new(()),
            last_sequence: AtomicU64::new(init.last_sequence),
            manifest: Mutex::new(init.manifest),
            next_table_id: AtomicU64::new(init.next_table_id),
            next_wal_id: AtomicU64::new(init.next_wal_id),
            next_job_id: AtomicU64::new(1),
            flushed_wal_id: AtomicU64::new(init.flushed_wal_id),
            flushes: Mutex::new(FlushQueue::default()),
            reservations: Mutex::new(Reservations::default()),
            running_flushes: AtomicUsize::new(0),
            running_compactions: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            bg_error: Mutex::new(None),
            stall_lock: Mutex::new(()),
            stall_cv: Condvar::new(),
            snapshots: Arc::new(SnapshotList::new()),
            files: Arc::new(FileRegistry::new()),
        }
    }

    pub fn current(&self) -> Result<Current> {
        Ok(self.current.read()?.clone())
    }

    pub fn version(&self) -> Result<Arc<Version>> {
        Ok(self.current.read()?.version.clone())
    }

    /// The current structures and the sequence a default read uses with them.
    ///
    /// The sequence is loaded under the read lock. Flush and compaction swap
    /// their outputs in under the write lock, so no output dropping versions
    /// at or below this sequence can be installed until the clone is taken.
    pub fn read_view(&self) -> Result<(Current, u64)> {
        let current = self.current.read()?;
        let seq = self.visible_sequence();
        Ok((current.clone(), seq))
    }

    pub fn visible_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    pub fn next_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_wal_id(&self) -> u64 {
        self.next_wal_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Oldest sequence any reader may still ask for.
    pub fn oldest_snapshot(&self) -> u64 {
        self.snapshots.oldest_or(|| self.visible_sequence())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn start_flush(&self) -> FlushGuard<'_> {
        self.running_flushes.fetch_add(1, Ordering::SeqCst);
        FlushGuard { state: self }
    }

    pub fn start_compaction(&self) -> CompactionGuard<'_> {
        self.running_compactions.fetch_add(1, Ordering::SeqCst);
        CompactionGuard { state: self }
    }

    /// Records a fatal background error; later writes fail with it.
    pub fn set_background_error(&self, error: &Error) {
        if let Ok(mut slot) = self.bg_error.lock() {
            if slot.is_none() {
                tracing::error!(error = %error, "Engine entered background error state");
                *slot = Some(error.to_string());
            }
        }
        self.notify_progress();
    }

    pub fn check_background_error(&self) -> Result<()> {
        match self.bg_error.lock()?.as_ref() {
            Some(message) => Err(Error::Background(message.clone())),
            None => Ok(()),
        }
    }

    /// Wakes writers waiting on a stall.
    pub fn notify_progress(&self) {
        let _guard = self.stall_lock.lock();
        self.stall_cv.notify_all();
    }

    /// Waits for the next flush or compaction to make progress, at most `timeout`.
    pub fn wait_for_progress(&self, timeout: Duration) -> Result<()> {
        let guard = self.stall_lock.lock()?;
        let _ = self.stall_cv.wait_timeout(guard, timeout)?;
        Ok(())
    }

    /// Blocks while `stalled` holds, up to `timeout`. `Busy` on timeout.
    pub fn wait_while_stalled(
        &self,
        timeout: Duration,
        mut stalled: impl FnMut() -> Result<bool>,
    ) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.stall_lock.lock()?;
        loop {
            self.check_background_error()?;
            if self.is_shutting_down() {
                return Err(Error::Aborted("engine is shutting down".into()));
            }
            if !stalled()? {
                return Ok(());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::Busy(format!(
                    "write stalled for more than {timeout:?}"
                )));
            }
            // Bounded waits so progress missed between the check and the
            // wait is picked up on the next round.
            let wait = (deadline - now).min(Duration::from_millis(50));
            guard = self.stall_cv.wait_timeout(guard, wait)?.0;
        }
    }
}

pub struct FlushGuard<'a> {
    state: &'a LsmState,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.state.running_flushes.fetch_sub(1, Ordering::SeqCst);
        self.state.notify_progress();
    }
}

pub struct CompactionGuard<'a> {
    state: &'a LsmState,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.state.running_compactions.fetch_sub(1, Ordering::SeqCst);
        self.state.notify_progress();
    }
}

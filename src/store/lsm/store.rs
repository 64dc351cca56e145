use super::{
    super::Store,
    batch::WriteBatch,
    compaction::{self, picker},
    files::{LiveFiles, LiveWal, LOCK_FILE, MANIFEST_FILE},
    flush,
    iterator::{EntryIterator, MergeIterator, ScanIterator},
    key::MAX_SEQUENCE,
    metrics::{self, Stats},
    recovery,
    snapshot::Snapshot,
    state::{Current, LsmState},
    tasks::{CompactionTask, FlushTask, MetricsTask},
};

use crate::{
    config::{CompactionStrategy, Options, ReadOptions, WriteOptions},
    error::Result,
    flock::FileLock,
    scheduler::{submit_on, Scheduler},
    Error,
};

use std::{
    fs,
    ops::RangeBounds,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// How long `close` waits for running background jobs.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on the delay between flush retries.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// State shared between the engine handle and its background jobs.
pub(crate) struct EngineInner {
    pub(crate) options: Options,
    pub(crate) state: LsmState,
    jobs: Handle,
    scheduled_flushes: AtomicUsize,
    scheduled_compactions: AtomicUsize,
}

/// An embedded LSM-tree key-value store.
///
/// All methods take `&self`; an `Engine` can be shared between threads
/// behind an `Arc`. Background flushes and compactions run on a runtime the
/// engine owns, so the blocking methods (`flush`, `compact_all`, `close`)
/// must be called from outside async code.
pub struct Engine {
    inner: Arc<EngineInner>,
    scheduler: Option<Scheduler>,
    lock: Option<FileLock>,
}

impl Engine {
    /// Opens (or creates) the database in `options.dir`.
    pub fn open(options: Options) -> Result<Self> {
        options.validate()?;
        let dir = options.dir.clone();
        let exists = dir.join(MANIFEST_FILE).exists();
        if exists && options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "database {} already exists",
                dir.display()
            )));
        }
        if !exists && !options.create_if_missing {
            return Err(Error::NotFound(format!(
                "database {} does not exist",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;

        let lock = FileLock::lock(dir.join(LOCK_FILE)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                Error::Busy(format!("{} is locked by another engine", dir.display()))
            } else {
                Error::LockError(e)
            }
        })?;

        let state = recovery::recover_state(&options)?;
        let scheduler = Scheduler::new(options.parallelism)?;
        let inner = Arc::new(EngineInner {
            options,
            state,
            jobs: scheduler.handle().clone(),
            scheduled_flushes: AtomicUsize::new(0),
            scheduled_compactions: AtomicUsize::new(0),
        });

        scheduler
            .register(Arc::new(FlushTask::new(inner.clone())))?
            .register(Arc::new(CompactionTask::new(inner.clone())))?
            .register(Arc::new(MetricsTask::new(inner.clone())))?;

        // Memtables recovered from older WAL segments still need flushing.
        inner.maybe_schedule_flush()?;
        inner.maybe_schedule_compaction()?;

        info!(dir = %dir.display(), "Opened engine");
        Ok(Self {
            inner,
            scheduler: Some(scheduler),
            lock: Some(lock),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.state.dir
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn put(
        &self,
        options: &WriteOptions,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.inner.write(options, &batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: impl Into<Vec<u8>>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.inner.write(options, &batch)
    }

    /// Applies every operation in `batch` atomically.
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(options, &batch)
    }

    /// Newest value of `key` visible at the read sequence, `None` if the key
    /// is absent or deleted.
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (current, seq) = self.inner.read_view(options)?;
        get_at(&current, key, seq)
    }

    /// Pins the current state. Reads with `ReadOptions::at(snapshot.sequence())`
    /// see it until the snapshot is dropped.
    pub fn snapshot(&self) -> Snapshot {
        let state = &self.inner.state;
        state.snapshots.acquire_with(|| state.visible_sequence())
    }

    /// Visible key-value pairs within `range`, in key order.
    pub fn scan(
        &self,
        options: &ReadOptions,
        range: impl RangeBounds<Vec<u8>>,
    ) -> Result<ScanIterator> {
        let (current, seq) = self.inner.read_view(options)?;
        let start = range.start_bound().cloned();
        let end = range.end_bound().cloned();

        let mut sources: Vec<EntryIterator> = Vec::new();
        sources.push(Box::new(
            current.active.memtable().iter(start.clone(), end.clone()),
        ));
        for memtable in current.frozen.iter().rev() {
            sources.push(Box::new(memtable.memtable().iter(start.clone(), end.clone())));
        }
        sources.extend(current.version.iterators(&start, &end));

        Ok(ScanIterator::new(MergeIterator::new(sources), seq))
    }

    /// Freezes the active memtable and waits until every frozen memtable is
    /// written to a table.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush_all()
    }

    /// Flushes, then merges every table into the deepest populated level.
    pub fn compact_all(&self) -> Result<()> {
        self.inner.flush_all()?;
        let inner = self.inner.clone();
        let compacted = submit_on(&self.inner.jobs, "compact-all", move || {
            compaction::compact_all(&inner.state, &inner.options)
        })
        .wait()?;
        if compacted {
            info!("Manual compaction finished");
        }
        Ok(())
    }

    /// Makes every write so far durable.
    pub fn sync_wal(&self) -> Result<()> {
        self.inner.state.current()?.active.sync()
    }

    pub fn stats(&self) -> Result<Stats> {
        metrics::collect(&self.inner.state)
    }

    /// Captures the files that make up the database and pins them against
    /// deletion until the returned value is dropped.
    pub fn live_files(&self, flush: bool) -> Result<LiveFiles> {
        if flush {
            self.flush()?;
        }
        self.inner.live_files()
    }

    /// Stops background work, syncs the WAL and releases the directory lock.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(scheduler) = self.scheduler.take() else {
            return Ok(());
        };
        let state = &self.inner.state;
        state.shutting_down.store(true, Ordering::SeqCst);
        state.notify_progress();

        if Handle::try_current().is_ok() {
            // Blocking here would stall the caller's runtime.
            drop(scheduler);
        } else {
            scheduler.shutdown_blocking(SHUTDOWN_TIMEOUT)?;
        }

        let synced = state.current().and_then(|current| current.active.sync());
        self.lock.take();
        info!(dir = %state.dir.display(), "Closed engine");
        synced
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Engine shutdown failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.inner.state.dir)
            .finish()
    }
}

impl EngineInner {
    fn read_view(&self, options: &ReadOptions) -> Result<(Current, u64)> {
        match options.snapshot {
            Some(seq) => Ok((self.state.current()?, seq)),
            None => self.state.read_view(),
        }
    }

    fn write(self: &Arc<Self>, options: &WriteOptions, batch: &WriteBatch) -> Result<()> {
        batch.validate()?;
        if batch.is_empty() {
            return Ok(());
        }
        self.state.check_background_error()?;
        self.throttle()?;

        let froze = {
            let _writer = self.state.write_lock.lock()?;
            self.state.check_background_error()?;

            let base_seq = self.state.visible_sequence() + 1;
            let last_seq = base_seq + batch.len() as u64 - 1;
            if last_seq > MAX_SEQUENCE {
                return Err(Error::InvalidState("sequence numbers exhausted".into()));
            }

            let active = self.state.current.read()?.active.clone();
            if let Err(e) = active.write(base_seq, batch, options.sync) {
                // The WAL may now hold a partial record; stop taking writes.
                self.state.set_background_error(&e);
                return Err(e);
            }
            self.state.last_sequence.store(last_seq, Ordering::SeqCst);

            if active.size() >= self.options.write_buffer_size {
                flush::freeze_active_memtable(&self.state, &self.options).unwrap_or_else(|e| {
                    warn!(error = %e, "Failed to freeze memtable, retrying on next write");
                    false
                })
            } else {
                false
            }
        };

        if froze {
            self.maybe_schedule_flush()?;
        }
        Ok(())
    }

    fn is_stalled(&self) -> Result<bool> {
        let current = self.state.current.read()?;
        let compaction = &self.options.compaction;
        let too_many_memtables = current.frozen.len() >= self.options.max_write_buffer_number;
        // Without automatic compaction nothing would ever drain L0.
        let too_many_l0 = compaction.strategy != CompactionStrategy::None
            && current.version.l0_count() >= compaction.level0_stop_writes_trigger;
        Ok(too_many_memtables || too_many_l0)
    }

    fn throttle(self: &Arc<Self>) -> Result<()> {
        if !self.is_stalled()? {
            return Ok(());
        }
        self.maybe_schedule_flush()?;
        self.maybe_schedule_compaction()?;
        debug!("Write stalled waiting for background work");
        self.state
            .wait_while_stalled(self.options.write_stall_timeout, || self.is_stalled())
    }

    /// Flushes with retries; exhausting them is fatal for the engine.
    fn run_flush(&self) -> Result<bool> {
        let mut attempt = 0u32;
        loop {
            match flush::flush_memtable(&self.state, &self.options) {
                Ok(flushed) => return Ok(flushed),
                Err(e)
                    if attempt < self.options.max_background_retries
                        && !self.state.is_shutting_down() =>
                {
                    attempt += 1;
                    let backoff = Duration::from_millis(50 << attempt.min(10)).min(MAX_RETRY_BACKOFF);
                    warn!(attempt, error = %e, ?backoff, "Flush failed, retrying");
                    std::thread::sleep(backoff);
                }
                Err(e) => {
                    self.state.set_background_error(&e);
                    return Err(e);
                }
            }
        }
    }

    /// Claims a slot out of `limit`, false when all are taken.
    fn try_take_slot(counter: &AtomicUsize, limit: usize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Submits flush jobs for frozen memtables nobody is building yet.
    pub(crate) fn maybe_schedule_flush(self: &Arc<Self>) -> Result<()> {
        if self.state.is_shutting_down() || self.state.check_background_error().is_err() {
            return Ok(());
        }
        let pending = self.state.current.read()?.frozen.len();
        let building = self.state.flushes.lock()?.in_flight();
        let mut unclaimed = pending.saturating_sub(building);

        while unclaimed > 0
            && Self::try_take_slot(&self.scheduled_flushes, self.options.max_background_flushes)
        {
            unclaimed -= 1;
            let inner = Arc::clone(self);
            debug!(pending, "Scheduling flush");
            // Completion is observed through state, not the handle.
            let _ = submit_on(&self.jobs, "flush", move || {
                let result = inner.run_flush();
                inner.scheduled_flushes.fetch_sub(1, Ordering::SeqCst);
                if let Ok(true) = result {
                    inner.maybe_schedule_flush()?;
                    inner.maybe_schedule_compaction()?;
                }
                result
            });
        }
        Ok(())
    }

    /// Submits compaction jobs while some level is over its threshold.
    pub(crate) fn maybe_schedule_compaction(self: &Arc<Self>) -> Result<()> {
        if self.state.is_shutting_down() {
            return Ok(());
        }
        let version = self.state.version()?;
        if !picker::needs_compaction(&version, &self.options.compaction, self.options.target_file_size) {
            return Ok(());
        }

        let limit = self.options.max_background_compactions;
        let mut submitted = 0;
        while submitted < limit && Self::try_take_slot(&self.scheduled_compactions, limit) {
            submitted += 1;
            let inner = Arc::clone(self);
            let _ = submit_on(&self.jobs, "compaction", move || {
                let result = compaction::compact(&inner.state, &inner.options);
                inner.scheduled_compactions.fetch_sub(1, Ordering::SeqCst);
                // Failures are retried by the periodic task.
                if let Ok(true) = result {
                    inner.maybe_schedule_compaction()?;
                }
                result
            });
        }
        Ok(())
    }

    fn flush_all(self: &Arc<Self>) -> Result<()> {
        {
            let _writer = self.state.write_lock.lock()?;
            flush::freeze_active_memtable(&self.state, &self.options)?;
        }
        let Some(target) = self.state.current.read()?.frozen.back().map(|m| m.id()) else {
            return Ok(());
        };

        loop {
            self.state.check_background_error()?;
            if self.state.is_shutting_down() {
                return Err(Error::Aborted("engine is shutting down".into()));
            }
            let oldest = self.state.current.read()?.frozen.front().map(|m| m.id());
            match oldest {
                Some(id) if id <= target => {}
                _ => break,
            }

            let inner = Arc::clone(self);
            let flushed = submit_on(&self.jobs, "flush", move || inner.run_flush()).wait()?;
            if !flushed {
                // Every remaining memtable is being built by another job.
                self.state.wait_for_progress(Duration::from_millis(50))?;
            }
        }

        self.maybe_schedule_compaction()
    }

    fn live_files(&self) -> Result<LiveFiles> {
        // Holding the write lock freezes the WAL lengths and the sequence;
        // holding the manifest lock keeps flushes from retiring segments.
        let _writer = self.state.write_lock.lock()?;
        let _manifest = self.state.manifest.lock()?;
        let current = self.state.current()?;

        let wals: Vec<LiveWal> = current
            .frozen
            .iter()
            .map(|m| m.wal())
            .chain(std::iter::once(current.active.wal()))
            .map(|wal| LiveWal {
                id: wal.id(),
                path: wal.path().to_path_buf(),
                len: wal.len(),
            })
            .collect();

        Ok(LiveFiles::new(
            self.state.dir.clone(),
            current.version.level_metas(),
            wals,
            self.state.visible_sequence(),
            self.state.next_table_id.load(Ordering::SeqCst),
            self.state.flushed_wal_id.load(Ordering::SeqCst),
            self.state.files.clone(),
        ))
    }
}

/// Newest version of `key` at `seq`: memtables newest first, then tables.
fn get_at(current: &Current, key: &[u8], seq: u64) -> Result<Option<Vec<u8>>> {
    if let Some(value) = current.active.get(key, seq) {
        return Ok(value);
    }
    for memtable in current.frozen.iter().rev() {
        if let Some(value) = memtable.get(key, seq) {
            return Ok(value);
        }
    }
    Ok(current.version.get(key, seq)?.flatten())
}

impl Store for Engine {
    type ScanIterator<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.put(&WriteOptions::default(), key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        Engine::delete(self, &WriteOptions::default(), key)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        Engine::write(self, &WriteOptions::default(), batch)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Engine::get(self, &ReadOptions::default(), key)
    }

    fn scan<'a>(
        &'a self,
        range: impl RangeBounds<Vec<u8>> + Clone + Send + Sync + 'a,
    ) -> Self::ScanIterator<'a> {
        match Engine::scan(self, &ReadOptions::default(), range) {
            Ok(iter) => Box::new(iter),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn sync(&self) -> Result<()> {
        self.sync_wal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionOptions;
    use crate::store::lsm::files;
    use std::thread;

    fn small_options(dir: &Path) -> Options {
        Options::new(dir)
            .write_buffer_size(4 * 1024)
            .target_file_size(16 * 1024)
            .flush_interval(Duration::from_millis(20))
            .compaction_interval(Duration::from_millis(20))
            .compaction(
                CompactionOptions::default()
                    .level0_file_num_compaction_trigger(2)
                    .max_bytes_for_level_base(64 * 1024),
            )
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key_{i:05}").into_bytes()
    }

    #[test]
    fn test_put_get_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        let w = WriteOptions::default();
        let r = ReadOptions::default();

        engine.put(&w, "a", "1")?;
        engine.put(&w, "a", "2")?;
        assert_eq!(engine.get(&r, b"a")?, Some(b"2".to_vec()));

        engine.delete(&w, "a")?;
        assert_eq!(engine.get(&r, b"a")?, None);
        assert_eq!(engine.get(&r, b"missing")?, None);
        engine.close()
    }

    #[test]
    fn test_empty_key_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        let err = engine.put(&WriteOptions::default(), "", "v").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        Ok(())
    }

    #[test]
    fn test_open_flags() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");

        let err = Engine::open(Options::new(&path).create_if_missing(false)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        Engine::open(Options::new(&path))?.close()?;
        let err = Engine::open(Options::new(&path).error_if_exists(true)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        Ok(())
    }

    #[test]
    fn test_second_open_is_busy() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        let err = Engine::open(Options::new(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        engine.close()?;

        Engine::open(Options::new(dir.path()))?.close()
    }

    #[test]
    fn test_snapshot_reads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        let w = WriteOptions::default();

        engine.put(&w, "k", "old")?;
        let snapshot = engine.snapshot();
        engine.put(&w, "k", "new")?;
        engine.delete(&w, "gone")?;

        let at = ReadOptions::at(snapshot.sequence());
        assert_eq!(engine.get(&at, b"k")?, Some(b"old".to_vec()));
        assert_eq!(engine.get(&ReadOptions::default(), b"k")?, Some(b"new".to_vec()));

        engine.flush()?;
        engine.compact_all()?;
        assert_eq!(engine.get(&at, b"k")?, Some(b"old".to_vec()));
        Ok(())
    }

    #[test]
    fn test_scan_merges_memtables_and_tables() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        let w = WriteOptions::default();

        engine.put(&w, "a", "1")?;
        engine.put(&w, "c", "3")?;
        engine.flush()?;
        engine.put(&w, "b", "2")?;
        engine.delete(&w, "c")?;
        engine.put(&w, "d", "4")?;

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = engine
            .scan(&ReadOptions::default(), ..)?
            .collect::<Result<_>>()?;
        let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], b"b", b"d"]);

        let bounded: Vec<_> = engine
            .scan(&ReadOptions::default(), b"b".to_vec()..b"d".to_vec())?
            .collect::<Result<_>>()?;
        assert_eq!(bounded, vec![(b"b".to_vec(), b"2".to_vec())]);

        let prefixed: Vec<_> = Store::scan_prefix(&engine, b"d").collect::<Result<_>>()?;
        assert_eq!(prefixed, vec![(b"d".to_vec(), b"4".to_vec())]);

        let mut batch = WriteBatch::new();
        batch.put("da", "5").delete("d");
        Store::write(&engine, batch)?;
        Store::delete(&engine, b"a")?;
        let prefixed: Vec<_> = Store::scan_prefix(&engine, b"d").collect::<Result<_>>()?;
        assert_eq!(prefixed, vec![(b"da".to_vec(), b"5".to_vec())]);
        assert_eq!(Store::get(&engine, b"a")?, None);
        Ok(())
    }

    #[test]
    fn test_background_flush_and_compaction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(small_options(dir.path()))?;
        let w = WriteOptions::default();

        for i in 0..2000 {
            engine.put(&w, key(i), vec![b'x'; 64])?;
        }
        engine.flush()?;

        // Give the scheduler a moment to settle L0.
        for _ in 0..100 {
            let stats = engine.stats()?;
            if stats.levels[0].tables < 2 && stats.running_compactions == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        let stats = engine.stats()?;
        assert!(stats.table_count() > 0);
        assert_eq!(stats.frozen_memtables, 0);
        for i in (0..2000).step_by(97) {
            assert_eq!(engine.get(&ReadOptions::default(), &key(i))?, Some(vec![b'x'; 64]));
        }
        assert_eq!(engine.scan(&ReadOptions::default(), ..)?.count(), 2000);
        engine.close()
    }

    #[test]
    fn test_reopen_recovers_unflushed_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let engine = Engine::open(Options::new(dir.path()))?;
            engine.put(&WriteOptions::sync(), "durable", "yes")?;
            engine.put(&WriteOptions::default(), "buffered", "also")?;
            engine.close()?;
        }

        let engine = Engine::open(Options::new(dir.path()))?;
        let r = ReadOptions::default();
        assert_eq!(engine.get(&r, b"durable")?, Some(b"yes".to_vec()));
        assert_eq!(engine.get(&r, b"buffered")?, Some(b"also".to_vec()));
        assert_eq!(engine.stats()?.last_sequence, 2);

        engine.put(&WriteOptions::default(), "after", "reopen")?;
        assert_eq!(engine.stats()?.last_sequence, 3);
        Ok(())
    }

    #[test]
    fn test_write_stall_times_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = Options::new(dir.path())
            .write_buffer_size(1)
            .max_write_buffer_number(2)
            .write_stall_timeout(Duration::from_millis(100));
        let engine = Engine::open(options)?;

        // Occupy every flush slot so frozen memtables pile up.
        engine.inner.scheduled_flushes.store(1, Ordering::SeqCst);

        let w = WriteOptions::default();
        engine.put(&w, key(0), "v")?;
        engine.put(&w, key(1), "v")?;
        let err = engine.put(&w, key(2), "v").unwrap_err();
        assert!(matches!(err, Error::Busy(_)), "unexpected {err:?}");

        engine.inner.scheduled_flushes.store(0, Ordering::SeqCst);
        engine.flush()?;
        engine.put(&w, key(2), "v")?;
        Ok(())
    }

    #[test]
    fn test_live_files_pins_tables() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        let w = WriteOptions::default();

        engine.put(&w, "a", "1")?;
        engine.flush()?;
        engine.put(&w, "b", "2")?;

        let live = engine.live_files(false)?;
        assert_eq!(live.tables.len(), 1);
        assert_eq!(live.last_sequence, 2);
        let table = live.table_path(live.tables[0].id);

        engine.put(&w, "a", "3")?;
        engine.compact_all()?;
        assert!(table.exists(), "pinned input outlives compaction");
        // The pinned table and the pinned WAL segment.
        assert_eq!(engine.stats()?.deferred_deletions, 2);

        drop(live);
        assert!(!table.exists());
        Ok(())
    }

    #[test]
    fn test_files_listed_under_layout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        engine.put(&WriteOptions::default(), "k", "v")?;
        engine.flush()?;

        assert!(dir.path().join(LOCK_FILE).exists());
        assert!(dir.path().join(MANIFEST_FILE).exists());
        let (tables, _) = files::list_ssts(dir.path())?;
        assert_eq!(tables.len(), 1);
        let (wals, _) = files::list_wals(dir.path())?;
        assert_eq!(wals.len(), 1, "only the active segment remains");
        Ok(())
    }

    #[test]
    fn test_read_view_outlives_flush() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        let (w, r) = (WriteOptions::default(), ReadOptions::default());
        engine.put(&w, "k", "v1")?;

        let (view, seq) = engine.inner.read_view(&r)?;
        engine.put(&w, "k", "v2")?;
        engine.flush()?;

        // The flushed table only keeps v2.
        let current = engine.inner.state.current()?;
        assert_eq!(get_at(&current, b"k", seq)?, None);

        assert_eq!(get_at(&view, b"k", seq)?, Some(b"v1".to_vec()));
        assert_eq!(engine.get(&r, b"k")?, Some(b"v2".to_vec()));
        engine.close()
    }

    #[test]
    fn test_oversized_write_rejected_before_wal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        let w = WriteOptions::sync();

        let huge = vec![0u8; crate::store::lsm::wal::MAX_RECORD_SIZE];
        let err = engine.put(&w, "big", huge).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err:?}");
        engine.put(&w, "small", "after")?;
        engine.close()?;

        let engine = Engine::open(Options::new(dir.path()))?;
        let r = ReadOptions::default();
        assert_eq!(engine.get(&r, b"big")?, None);
        assert_eq!(engine.get(&r, b"small")?, Some(b"after".to_vec()));
        engine.close()
    }

    #[test]
    fn test_flush_failure_stops_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = Options::new(dir.path())
            .max_background_retries(0)
            .flush_interval(Duration::from_secs(3600));
        let engine = Engine::open(options)?;
        let (w, r) = (WriteOptions::default(), ReadOptions::default());
        engine.put(&w, "k", "v")?;

        // Table files can no longer be created.
        let sst_dir = files::sst_dir(dir.path());
        fs::remove_dir(&sst_dir)?;
        fs::write(&sst_dir, b"")?;

        assert!(engine.flush().is_err());
        assert!(matches!(engine.put(&w, "k2", "v"), Err(Error::Background(_))));

        assert_eq!(engine.inner.state.current()?.frozen.len(), 1);
        engine.inner.maybe_schedule_flush()?;
        assert_eq!(engine.inner.scheduled_flushes.load(Ordering::SeqCst), 0);
        assert_eq!(engine.get(&r, b"k")?, Some(b"v".to_vec()));
        Ok(())
    }

    #[test]
    fn test_wal_append_failure_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(Options::new(dir.path()))?;
        let w = WriteOptions::default();
        engine.put(&w, "a", "1")?;

        engine.inner.state.current()?.active.wal().close()?;
        assert!(matches!(engine.put(&w, "b", "2"), Err(Error::InvalidState(_))));
        assert!(matches!(engine.put(&w, "c", "3"), Err(Error::Background(_))));
        assert_eq!(engine.get(&ReadOptions::default(), b"a")?, Some(b"1".to_vec()));
        assert_eq!(engine.stats()?.last_sequence, 1);
        Ok(())
    }
}

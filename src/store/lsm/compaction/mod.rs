//! Merging tables into deeper levels.
//!
//! A compaction job runs in four steps:
//!
//! 1. **Pick**: a [`picker`] strategy selects input tables and the job is
//!    reserved so that no concurrent job touches the same tables or the
//!    same key range on the same levels.
//! 2. **Merge**: the inputs are k-way merged newest first. Versions hidden
//!    from every reader are dropped, and so are tombstones when nothing
//!    older can exist below the target level.
//! 3. **Write**: survivors are written to new tables at the target level,
//!    split once a table reaches `target_file_size`.
//! 4. **Install**: `BeginCompaction` and `CommitCompaction` are appended to
//!    the manifest and synced, then the level layout is swapped. Inputs are
//!    deleted once no backup pins them.
//!
//! A failed or aborted job removes its outputs and leaves the layout as it
//! was; the next scheduling round tries again.

pub mod picker;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::files;
use super::iterator::{EntryIterator, MergeIterator};
use super::key::InternalKey;
use super::manifest::{SSTable, VersionEdit};
use super::sstable::{Table, TableBuilder};
use super::state::{LsmState, NUM_LEVELS};
use crate::config::Options;
use crate::error::Result;
use crate::Error;

pub use picker::{Candidate, Cursors};

/// Entries merged between checks of the shutdown flag.
const ABORT_CHECK_INTERVAL: usize = 1024;

#[derive(Debug, Clone)]
struct Reservation {
    job_id: u64,
    levels: (u32, u32),
    range: (Vec<u8>, Vec<u8>),
    tables: HashSet<u64>,
}

impl Reservation {
    fn touches_level(&self, level: u32) -> bool {
        self.levels.0 == level || self.levels.1 == level
    }

    fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.range.0.as_slice() <= end && self.range.1.as_slice() >= start
    }
}

/// Running jobs and what they hold.
#[derive(Debug, Default)]
pub struct Reservations {
    jobs: Vec<Reservation>,
    /// Per-level round-robin positions for leveled picking.
    pub cursors: Cursors,
}

impl Reservations {
    /// A candidate conflicts with a running job if they share an input table,
    /// or share a level and their key ranges overlap.
    pub fn conflicts(&self, candidate: &Candidate) -> bool {
        let (start, end) = candidate.key_range();
        self.jobs.iter().any(|job| {
            candidate.inputs.iter().any(|t| job.tables.contains(&t.id()))
                || ((job.touches_level(candidate.source_level)
                    || job.touches_level(candidate.target_level))
                    && job.overlaps(&start, &end))
        })
    }

    pub fn reserve(&mut self, job_id: u64, candidate: &Candidate) {
        self.jobs.push(Reservation {
            job_id,
            levels: (candidate.source_level, candidate.target_level),
            range: candidate.key_range(),
            tables: candidate.inputs.iter().map(|t| t.id()).collect(),
        });
    }

    pub fn release(&mut self, job_id: u64) {
        self.jobs.retain(|job| job.job_id != job_id);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Whether a running job will write into a level below `level` within the range.
    fn writes_below(&self, level: u32, start: &[u8], end: &[u8]) -> bool {
        self.jobs
            .iter()
            .any(|job| job.levels.1 > level && job.overlaps(start, end))
    }
}

/// A reserved job.
#[derive(Debug)]
pub struct CompactionJob {
    pub job_id: u64,
    pub candidate: Candidate,
    /// No data older than the inputs exists below the target level.
    pub bottommost: bool,
}

/// Decides which versions survive a merge.
///
/// Entries arrive in internal-key order, so every version of a user key is
/// seen newest first. A version is dropped when a newer version of the same
/// key is already visible to the oldest reader; a tombstone is dropped when
/// it is visible to every reader and nothing below can resurface.
#[derive(Debug)]
pub(crate) struct GarbageFilter {
    oldest_snapshot: u64,
    bottommost: bool,
    current_key: Option<Vec<u8>>,
    last_seq: u64,
    pub dropped: u64,
}

impl GarbageFilter {
    pub fn new(oldest_snapshot: u64, bottommost: bool) -> Self {
        Self {
            oldest_snapshot,
            bottommost,
            current_key: None,
            last_seq: u64::MAX,
            dropped: 0,
        }
    }

    pub fn keep(&mut self, key: &InternalKey, is_tombstone: bool) -> bool {
        if self.current_key.as_deref() != Some(key.user_key.as_slice()) {
            self.current_key = Some(key.user_key.clone());
            self.last_seq = u64::MAX;
        }

        let keep = if self.last_seq <= self.oldest_snapshot {
            false
        } else {
            !(is_tombstone && self.bottommost && key.seq <= self.oldest_snapshot)
        };
        self.last_seq = key.seq;
        if !keep {
            self.dropped += 1;
        }
        keep
    }
}

/// Writes merge output into tables of roughly `target_file_size`, never
/// splitting the versions of one user key across tables.
pub(crate) struct OutputTables<'a> {
    state: &'a LsmState,
    options: &'a Options,
    level: u32,
    target_size: u64,
    builder: Option<TableBuilder>,
    finished: Vec<Arc<SSTable>>,
    last_user_key: Vec<u8>,
}

impl<'a> OutputTables<'a> {
    pub fn new(state: &'a LsmState, options: &'a Options, level: u32) -> Self {
        Self {
            state,
            options,
            level,
            target_size: options.target_file_size,
            builder: None,
            finished: Vec::new(),
            last_user_key: Vec::new(),
        }
    }

    /// Writes everything into one table.
    pub fn single_table(mut self) -> Self {
        self.target_size = u64::MAX;
        self
    }

    pub fn add(&mut self, key: &InternalKey, value: Option<&[u8]>) -> Result<()> {
        let full = self
            .builder
            .as_ref()
            .is_some_and(|b| b.estimated_size() >= self.target_size);
        if full && key.user_key != self.last_user_key {
            self.finish_current()?;
        }

        let builder = match self.builder.take() {
            Some(builder) => builder,
            None => {
                let id = self.state.next_table_id();
                TableBuilder::create(
                    files::sst_path(&self.state.dir, id),
                    id,
                    self.level,
                    self.options.block_size,
                    self.options.bloom_bits_per_key,
                )?
            }
        };
        self.builder.insert(builder).add(key, value)?;
        self.last_user_key.clear();
        self.last_user_key.extend_from_slice(&key.user_key);
        Ok(())
    }

    fn finish_current(&mut self) -> Result<()> {
        if let Some(builder) = self.builder.take() {
            let path = builder.path().to_path_buf();
            let id = builder.id();
            let opened = builder
                .finish()
                .and_then(|meta| Ok(SSTable::new(Table::open(&path, id)?, meta)));
            match opened {
                Ok(sstable) => self.finished.push(Arc::new(sstable)),
                Err(e) => {
                    let _ = files::remove_file_if_exists(&path);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<Vec<Arc<SSTable>>> {
        if let Err(e) = self.finish_current() {
            self.abandon();
            return Err(e);
        }
        Ok(std::mem::take(&mut self.finished))
    }

    /// Removes everything written so far.
    pub fn abandon(mut self) {
        if let Some(builder) = self.builder.take() {
            if let Err(e) = builder.abandon() {
                warn!(error = %e, "Failed to remove partial table");
            }
        }
        for sstable in self.finished.drain(..) {
            let path = sstable.table.path().to_path_buf();
            drop(sstable);
            if let Err(e) = files::remove_file_if_exists(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove compaction output");
            }
        }
    }
}

/// Picks and reserves the next job, if any level needs one.
pub fn pick_task(state: &LsmState, options: &Options) -> Result<Option<CompactionJob>> {
    let version = state.version()?;
    let mut reservations = state.reservations.lock()?;
    let mut cursors = std::mem::take(&mut reservations.cursors);
    let candidate = picker::pick(
        &version,
        &options.compaction,
        options.target_file_size,
        &reservations,
        &mut cursors,
    );
    reservations.cursors = cursors;

    let Some(candidate) = candidate else {
        return Ok(None);
    };
    Ok(Some(reserve(state, &mut reservations, &version, candidate)))
}

fn reserve(
    state: &LsmState,
    reservations: &mut Reservations,
    version: &super::state::Version,
    candidate: Candidate,
) -> CompactionJob {
    let (start, end) = candidate.key_range();
    let input_ids: HashSet<u64> = candidate.inputs.iter().map(|t| t.id()).collect();
    let deeper_data = version.levels[candidate.target_level as usize + 1..]
        .iter()
        .flat_map(|l| l.sstables.iter())
        .any(|t| !input_ids.contains(&t.id()) && t.meta.overlaps(&start, &end));
    let bottommost =
        !deeper_data && !reservations.writes_below(candidate.target_level, &start, &end);

    let job_id = state.next_job_id();
    reservations.reserve(job_id, &candidate);
    CompactionJob {
        job_id,
        candidate,
        bottommost,
    }
}

/// Runs one compaction if any level needs it. Returns whether a job ran.
pub fn compact(state: &LsmState, options: &Options) -> Result<bool> {
    if state.running_compactions.load(Ordering::SeqCst) >= options.max_background_compactions {
        return Ok(false);
    }
    let Some(task) = pick_task(state, options)? else {
        return Ok(false);
    };
    run_reserved(state, options, task)?;
    Ok(true)
}

/// Merges every table into the deepest populated level (at least L1).
/// Waits for running jobs to finish first.
pub fn compact_all(state: &LsmState, options: &Options) -> Result<bool> {
    let task = loop {
        if state.is_shutting_down() {
            return Err(Error::Aborted("engine is shutting down".into()));
        }
        let version = state.version()?;
        let mut reservations = state.reservations.lock()?;
        if !reservations.is_empty() {
            drop(reservations);
            std::thread::sleep(std::time::Duration::from_millis(10));
            continue;
        }
        if version.table_count() == 0 {
            return Ok(false);
        }
        let target_level = version
            .levels
            .iter()
            .rposition(|l| !l.is_empty())
            .unwrap_or(1)
            .clamp(1, NUM_LEVELS - 1) as u32;
        let candidate = Candidate {
            source_level: 0,
            target_level,
            inputs: version.levels[0]
                .sstables
                .iter()
                .rev()
                .chain(version.levels[1..].iter().flat_map(|l| l.sstables.iter()))
                .cloned()
                .collect(),
        };
        break reserve(state, &mut reservations, &version, candidate);
    };
    run_reserved(state, options, task)?;
    Ok(true)
}

fn run_reserved(state: &LsmState, options: &Options, task: CompactionJob) -> Result<()> {
    let _guard = state.start_compaction();
    let job_id = task.job_id;
    let result = run_task(state, options, &task);
    if let Ok(mut reservations) = state.reservations.lock() {
        reservations.release(job_id);
    }
    state.notify_progress();
    if let Err(e) = &result {
        warn!(
            job_id,
            source_level = task.candidate.source_level,
            target_level = task.candidate.target_level,
            error = %e,
            "Compaction failed"
        );
    }
    result
}

fn run_task(state: &LsmState, options: &Options, task: &CompactionJob) -> Result<()> {
    let candidate = &task.candidate;
    info!(
        job_id = task.job_id,
        source_level = candidate.source_level,
        target_level = candidate.target_level,
        input_tables = candidate.inputs.len(),
        input_bytes = candidate.input_bytes(),
        bottommost = task.bottommost,
        "Starting compaction"
    );

    let outputs = merge(state, options, task)?;
    let output_bytes: u64 = outputs.iter().map(|t| t.size()).sum();
    let output_count = outputs.len();
    install(state, task, outputs)?;

    info!(
        job_id = task.job_id,
        target_level = candidate.target_level,
        output_tables = output_count,
        output_bytes,
        "Finished compaction"
    );
    Ok(())
}

fn merge(state: &LsmState, options: &Options, task: &CompactionJob) -> Result<Vec<Arc<SSTable>>> {
    let sources: Vec<EntryIterator> = task
        .candidate
        .inputs
        .iter()
        .map(|t| {
            Box::new(t.table.iter(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded))
                as EntryIterator
        })
        .collect();
    let mut filter = GarbageFilter::new(state.oldest_snapshot(), task.bottommost);
    let mut outputs = OutputTables::new(state, options, task.candidate.target_level);

    let result = (|| {
        for (i, entry) in MergeIterator::new(sources).enumerate() {
            if i % ABORT_CHECK_INTERVAL == 0 && state.is_shutting_down() {
                return Err(Error::Aborted(format!(
                    "compaction job {} interrupted by shutdown",
                    task.job_id
                )));
            }
            let (key, value) = entry?;
            if filter.keep(&key, value.is_none()) {
                outputs.add(&key, value.as_deref())?;
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            debug!(job_id = task.job_id, dropped = filter.dropped, "Merged compaction inputs");
            outputs.finish()
        }
        Err(e) => {
            outputs.abandon();
            Err(e)
        }
    }
}

fn install(state: &LsmState, task: &CompactionJob, outputs: Vec<Arc<SSTable>>) -> Result<()> {
    let candidate = &task.candidate;
    let deleted = candidate.table_ids();
    {
        let manifest = state.manifest.lock()?;
        let edits = [
            VersionEdit::BeginCompaction {
                seq: manifest.next_seq(),
                job_id: task.job_id,
                source_level: candidate.source_level,
                target_level: candidate.target_level,
            },
            VersionEdit::CommitCompaction {
                seq: manifest.next_seq(),
                job_id: task.job_id,
                source_level: candidate.source_level,
                deleted_tables: deleted.clone(),
                target_level: candidate.target_level,
                added_tables: outputs.iter().map(|t| t.meta.clone()).collect(),
            },
        ];
        if let Err(e) = manifest.log_and_sync(&edits) {
            let paths: Vec<_> = outputs.iter().map(|t| t.table.path().to_path_buf()).collect();
            drop(outputs);
            for path in paths {
                let _ = files::remove_file_if_exists(&path);
            }
            return Err(e);
        }

        let mut current = state.current.write()?;
        current.version = Arc::new(
            current
                .version
                .with_compaction(&deleted, candidate.target_level, outputs),
        );
    }

    for id in deleted {
        state.files.delete_obsolete(&files::sst_path(&state.dir, id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str, seq: u64) -> InternalKey {
        InternalKey::new(k.as_bytes().to_vec(), seq)
    }

    #[test]
    fn test_filter_drops_shadowed_versions() {
        let mut filter = GarbageFilter::new(100, false);
        assert!(filter.keep(&key("a", 50), false));
        assert!(!filter.keep(&key("a", 40), false));
        assert!(!filter.keep(&key("a", 30), true));
        assert!(filter.keep(&key("b", 10), false));
        assert_eq!(filter.dropped, 2);
    }

    #[test]
    fn test_filter_keeps_versions_for_snapshots() {
        // Oldest reader sits at 20: it still needs a@15.
        let mut filter = GarbageFilter::new(20, false);
        assert!(filter.keep(&key("a", 30), false));
        assert!(filter.keep(&key("a", 15), false));
        assert!(!filter.keep(&key("a", 10), false));
    }

    #[test]
    fn test_filter_tombstones_only_dropped_at_bottom() {
        let mut upper = GarbageFilter::new(100, false);
        assert!(upper.keep(&key("a", 50), true));

        let mut bottom = GarbageFilter::new(100, true);
        assert!(!bottom.keep(&key("a", 50), true));
        assert!(!bottom.keep(&key("a", 40), false));

        // A tombstone newer than the oldest reader must stay.
        let mut pinned = GarbageFilter::new(10, true);
        assert!(pinned.keep(&key("a", 50), true));
        assert!(pinned.keep(&key("a", 5), false));
    }
}

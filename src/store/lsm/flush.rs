//! Turning frozen memtables into level 0 tables.
//!
//! Several flushes may build tables at once, but they are installed strictly
//! in memtable age order: a finished output waits in the [`FlushQueue`] until
//! every older memtable has been installed. This keeps L0 ordered oldest to
//! newest, which reads rely on.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use super::compaction::{GarbageFilter, OutputTables};
use super::files;
use super::manifest::{SSTable, VersionEdit};
use super::memtable::{ActiveMemtable, FrozenMemtable, Memtable};
use super::state::LsmState;
use super::wal::Wal;
use crate::config::Options;
use crate::error::Result;

/// Memtables claimed by a flush, and outputs waiting for their turn.
#[derive(Debug, Default)]
pub struct FlushQueue {
    building: HashSet<u64>,
    /// `None` marks a memtable that produced no table.
    built: BTreeMap<u64, Option<Arc<SSTable>>>,
}

impl FlushQueue {
    pub fn in_flight(&self) -> usize {
        self.building.len()
    }
}

/// Swaps the active memtable for an empty one backed by a new WAL segment.
///
/// The caller must hold `state.write_lock`. Returns false when the active
/// memtable is empty.
pub fn freeze_active_memtable(state: &LsmState, options: &Options) -> Result<bool> {
    if state.current.read()?.active.memtable().is_empty() {
        return Ok(false);
    }

    let wal_id = state.next_wal_id();
    let wal = Wal::create(
        files::wal_path(&state.dir, wal_id),
        wal_id,
        options.wal_buffer_size,
    )?;
    let new_active = ActiveMemtable::new(Memtable::new(wal_id), wal);

    let frozen = {
        let mut current = state.current.write()?;
        let frozen = current.active.freeze()?;
        current.active = new_active;
        current.frozen.push_back(frozen.clone());
        frozen
    };

    debug!(
        memtable_id = frozen.id(),
        size = frozen.size(),
        next_wal_id = wal_id,
        "Froze active memtable"
    );
    Ok(true)
}

/// Builds the oldest unclaimed frozen memtable into a table, then installs
/// every output whose turn has come. Returns false when nothing was claimed.
pub fn flush_memtable(state: &LsmState, options: &Options) -> Result<bool> {
    let _guard = state.start_flush();
    let Some(frozen) = claim(state)? else {
        return Ok(false);
    };
    let id = frozen.id();

    match build_table(state, options, &frozen) {
        Ok(output) => {
            state.flushes.lock()?.built.insert(id, output);
        }
        Err(e) => {
            state.flushes.lock()?.building.remove(&id);
            return Err(e);
        }
    }

    install_ready(state)?;
    Ok(true)
}

fn claim(state: &LsmState) -> Result<Option<FrozenMemtable>> {
    let frozen: Vec<FrozenMemtable> = state.current.read()?.frozen.iter().cloned().collect();
    let mut queue = state.flushes.lock()?;
    for memtable in frozen {
        if queue.building.insert(memtable.id()) {
            return Ok(Some(memtable));
        }
    }
    Ok(None)
}

fn build_table(
    state: &LsmState,
    options: &Options,
    frozen: &FrozenMemtable,
) -> Result<Option<Arc<SSTable>>> {
    if frozen.memtable().is_empty() {
        return Ok(None);
    }

    let mut filter = GarbageFilter::new(state.oldest_snapshot(), false);
    let mut output = OutputTables::new(state, options, 0).single_table();
    let written = (|| {
        for entry in frozen.memtable().iter(Bound::Unbounded, Bound::Unbounded) {
            let (key, value) = entry?;
            if filter.keep(&key, value.is_none()) {
                output.add(&key, value.as_deref())?;
            }
        }
        Ok(())
    })();
    if let Err(e) = written {
        output.abandon();
        return Err(e);
    }

    let mut tables = output.finish()?;
    Ok(tables.pop())
}

/// Installs finished outputs in age order, stopping at the first memtable
/// that is still building.
fn install_ready(state: &LsmState) -> Result<()> {
    let manifest = state.manifest.lock()?;
    loop {
        let Some(oldest) = state.current.read()?.frozen.front().cloned() else {
            return Ok(());
        };
        let id = oldest.id();
        let Some(output) = state.flushes.lock()?.built.remove(&id) else {
            return Ok(());
        };

        if let Some(sstable) = &output {
            let edit = VersionEdit::Flush {
                seq: manifest.next_seq(),
                table: sstable.meta.clone(),
                wal_id: id,
                last_sequence: oldest.memtable().last_sequence(),
            };
            if let Err(e) = manifest.log_and_sync(&[edit]) {
                // Release the claim so the memtable is built again.
                let path = sstable.table.path().to_path_buf();
                drop(output);
                let _ = files::remove_file_if_exists(&path);
                state.flushes.lock()?.building.remove(&id);
                return Err(e);
            }
        }

        {
            let mut current = state.current.write()?;
            current.frozen.pop_front();
            if let Some(sstable) = &output {
                current.version = Arc::new(current.version.with_flush(sstable.clone()));
            }
        }
        state.flushes.lock()?.building.remove(&id);
        state.flushed_wal_id.fetch_max(id, Ordering::SeqCst);

        oldest.wal().close()?;
        state.files.delete_obsolete(oldest.wal().path());
        state.notify_progress();

        match &output {
            Some(sstable) => info!(
                memtable_id = id,
                table_id = sstable.id(),
                entries = sstable.meta.entry_count,
                size = sstable.size(),
                "Flushed memtable to level 0"
            ),
            None => debug!(memtable_id = id, "Dropped empty memtable"),
        }
    }
}

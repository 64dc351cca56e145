use super::files::{self, MANIFEST_FILE};
use super::manifest::{Manifest, ManifestState, SSTable};
use super::memtable::{ActiveMemtable, FrozenMemtable, Memtable};
use super::sstable::Table;
use super::state::{Current, LsmState, LsmStateInit, Version, NUM_LEVELS};
use super::wal::{recovery::recover_segment, Wal};
use crate::{config::Options, error::Result, Error};

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

/// Rebuilds engine state from the manifest and the WAL segments.
///
/// Tables referenced by the manifest are opened; any other table file is a
/// leftover of an interrupted flush or compaction and is deleted. WAL
/// segments at or below the manifest's flushed WAL id are deleted; the rest
/// are replayed, truncating torn tails. The newest segment becomes the
/// active memtable again and the others are queued for flushing.
pub(crate) fn recover_state(options: &Options) -> Result<LsmState> {
    let dir = &options.dir;
    std::fs::create_dir_all(files::wal_dir(dir))?;
    std::fs::create_dir_all(files::sst_dir(dir))?;

    let (manifest, manifest_state) = open_manifest(dir)?;
    let version = version_from_manifest_state(dir, &manifest_state)?;
    remove_orphan_tables(dir, &manifest_state)?;

    let mut last_sequence = manifest_state.last_sequence;
    let (wals, _) = files::list_wals(dir)?;
    let max_wal_id = wals.last().map(|(id, _)| *id).unwrap_or(0);
    let mut next_wal_id = max_wal_id.max(manifest_state.wal_id) + 1;

    let mut recovered = Vec::new();
    for (id, path) in wals {
        if id <= manifest_state.wal_id {
            info!(wal_id = id, "Deleting WAL segment already flushed");
            files::remove_file_if_exists(&path)?;
            continue;
        }
        let segment = recover_segment(&path, id)?;
        if segment.valid_len == 0 {
            // Crashed before its header was synced.
            files::remove_file_if_exists(&path)?;
            continue;
        }
        let memtable = Memtable::new(id);
        for (base_seq, batch) in &segment.batches {
            memtable.apply(*base_seq, batch)?;
        }
        if let Some(seq) = segment.last_sequence() {
            last_sequence = last_sequence.max(seq);
        }
        recovered.push((segment, memtable));
    }

    let active_segment = recovered.pop();
    let mut frozen = VecDeque::new();
    for (segment, memtable) in recovered {
        if memtable.is_empty() {
            files::remove_file_if_exists(&segment.path)?;
            continue;
        }
        let wal = Wal::open_for_append(&segment.path, segment.id, segment.valid_len, options.wal_buffer_size)?;
        frozen.push_back(FrozenMemtable::recovered(memtable, wal)?);
    }

    let active = match active_segment {
        Some((segment, memtable)) => {
            let wal = Wal::open_for_append(&segment.path, segment.id, segment.valid_len, options.wal_buffer_size)?;
            ActiveMemtable::new(memtable, wal)
        }
        None => {
            let id = next_wal_id;
            next_wal_id += 1;
            let wal = Wal::create(files::wal_path(dir, id), id, options.wal_buffer_size)?;
            ActiveMemtable::new(Memtable::new(id), wal)
        }
    };
    super::manifest::sync_parent(&files::wal_path(dir, 0))?;

    info!(
        dir = %dir.display(),
        tables = version.table_count(),
        frozen_memtables = frozen.len(),
        active_memtable = active.id(),
        last_sequence,
        "Recovered engine state"
    );

    Ok(LsmState::new(LsmStateInit {
        dir: dir.clone(),
        current: Current {
            active,
            frozen,
            version: Arc::new(version),
        },
        manifest,
        last_sequence,
        next_table_id: manifest_state.next_table_id,
        next_wal_id,
        flushed_wal_id: manifest_state.wal_id,
    }))
}

fn open_manifest(dir: &Path) -> Result<(Manifest, ManifestState)> {
    let path = dir.join(MANIFEST_FILE);
    files::remove_file_if_exists(&path.with_extension("tmp"))?;

    if !path.exists() {
        return Ok((Manifest::create(&path)?, ManifestState::new()));
    }

    let (manifest, state) = Manifest::open(&path)?;
    if manifest.should_snapshot() {
        drop(manifest);
        let manifest = Manifest::write_snapshot(&path, &state)?;
        return Ok((manifest, state));
    }
    Ok((manifest, state))
}

/// Opens every table the manifest references.
pub(crate) fn version_from_manifest_state(dir: &Path, state: &ManifestState) -> Result<Version> {
    let mut version = Version::new();
    for level_meta in &state.levels {
        if level_meta.level as usize >= NUM_LEVELS {
            return Err(Error::Corruption(format!(
                "manifest references level {}",
                level_meta.level
            )));
        }
        for table_meta in &level_meta.tables {
            let path = files::sst_path(dir, table_meta.id);
            if !path.exists() {
                return Err(Error::Corruption(format!(
                    "table {} referenced by the manifest is missing",
                    path.display()
                )));
            }
            let table = Table::open(&path, table_meta.id)?;
            version.levels[level_meta.level as usize]
                .add_sstable(Arc::new(SSTable::new(table, table_meta.clone())));
        }
    }
    Ok(version)
}

fn remove_orphan_tables(dir: &Path, state: &ManifestState) -> Result<()> {
    let live: HashSet<u64> = state.tables().map(|t| t.id).collect();
    let (tables, strays) = files::list_ssts(dir)?;
    for (id, path) in tables {
        if !live.contains(&id) {
            warn!(table_id = id, path = %path.display(), "Deleting orphan table");
            files::remove_file_if_exists(&path)?;
        }
    }
    for path in strays {
        warn!(path = %path.display(), "Deleting stray file in table directory");
        files::remove_file_if_exists(&path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lsm::batch::WriteBatch;

    #[test]
    fn test_recover_empty_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = Options::new(dir.path());

        let state = recover_state(&options)?;
        let current = state.current()?;
        assert_eq!(current.version.table_count(), 0);
        assert!(current.frozen.is_empty());
        assert_eq!(current.active.size(), 0);
        assert_eq!(state.visible_sequence(), 0);
        assert!(dir.path().join(MANIFEST_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_recover_replays_wal_segments() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = Options::new(dir.path());
        {
            let state = recover_state(&options)?;
            let mut batch = WriteBatch::new();
            batch.put(b"a".to_vec(), b"1".to_vec()).put(b"b".to_vec(), b"2".to_vec());
            state.current()?.active.write(1, &batch, true)?;
            super::super::flush::freeze_active_memtable(&state, &options)?;

            let mut batch = WriteBatch::new();
            batch.delete(b"a".to_vec());
            state.current()?.active.write(3, &batch, true)?;
        }

        let state = recover_state(&options)?;
        let current = state.current()?;
        assert_eq!(state.visible_sequence(), 3);
        assert_eq!(current.frozen.len(), 1);
        assert_eq!(current.frozen[0].get(b"b", 10), Some(Some(b"2".to_vec())));
        assert_eq!(current.active.get(b"a", 10), Some(None));

        // The reopened active segment accepts appends.
        let mut batch = WriteBatch::new();
        batch.put(b"c".to_vec(), b"3".to_vec());
        current.active.write(4, &batch, true)?;
        Ok(())
    }

    #[test]
    fn test_orphan_tables_deleted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = Options::new(dir.path());
        drop(recover_state(&options)?);

        let orphan = files::sst_path(dir.path(), 99);
        std::fs::write(&orphan, b"partial compaction output")?;
        let stray = files::sst_dir(dir.path()).join("000100.sst.tmp");
        std::fs::write(&stray, b"")?;

        drop(recover_state(&options)?);
        assert!(!orphan.exists());
        assert!(!stray.exists());
        Ok(())
    }

    #[test]
    fn test_missing_table_is_corruption() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut state = ManifestState::new();
        state.apply(crate::store::lsm::manifest::VersionEdit::Flush {
            seq: 1,
            table: crate::store::lsm::manifest::TableMeta {
                id: 7,
                level: 0,
                size: 100,
                entry_count: 1,
                min_key: b"a".to_vec(),
                max_key: b"a".to_vec(),
                min_seq: 1,
                max_seq: 1,
                checksum: 0,
            },
            wal_id: 1,
            last_sequence: 1,
        });

        let err = version_from_manifest_state(dir.path(), &state).unwrap_err();
        assert!(err.is_corruption());
        Ok(())
    }
}

//! Manifest log tracking the SSTable layout of the tree.
//!
//! The manifest is a WAL for metadata: where the data WAL records key-value
//! writes, the manifest records which tables exist at which level and which
//! data WAL segments have been made redundant by flushes.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | VersionEdit 1    |
//! +------------------+
//! | VersionEdit 2    |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each edit is framed as `length:u32 | edit | crc32:u32`.
//!
//! # Recovery
//!
//! Replay applies every intact edit in order. A torn or checksum-failing
//! trailing record is the footprint of a crash mid-append: replay stops
//! there and the file is truncated before new edits are appended. A bad
//! header is fatal. `BeginCompaction` without a matching commit leaves the
//! layout untouched; its outputs are orphans removed on open.
//!
//! Once the log grows past [`SNAPSHOT_THRESHOLD`] edits it is rewritten as a
//! single `Snapshot` edit through a temp file and an atomic rename.

pub mod edit;
pub mod header;
pub mod level;
pub mod meta;

use crate::error::Result;
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use header::{ManifestHeader, HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub use edit::VersionEdit;
pub use level::{Level, SSTable};
pub use meta::{LevelMeta, TableMeta};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Edit count after which the manifest is compacted into one snapshot on open.
pub const SNAPSHOT_THRESHOLD: u64 = 1000;

pub struct Manifest {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    next_seq: AtomicU64,
    edit_count: AtomicU64,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest").field("path", &self.path).finish()
    }
}

impl Manifest {
    /// Creates an empty manifest, replacing any file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(&ManifestHeader::new().encode())?;
        file.sync_all()?;
        sync_parent(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            next_seq: AtomicU64::new(1),
            edit_count: AtomicU64::new(0),
        })
    }

    /// Replays an existing manifest and reopens it for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, ManifestState)> {
        let path = path.into();
        let mut iter = ManifestIterator::open(&path)?;
        let mut state = ManifestState::new();
        let mut edit_count = 0u64;
        for edit in iter.by_ref() {
            state.apply(edit?);
            edit_count += 1;
        }

        let valid_len = iter.valid_len();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        if iter.is_torn() {
            warn!(
                path = %path.display(),
                file_len = iter.file_len(),
                valid_len,
                "Truncating torn manifest tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        debug!(
            path = %path.display(),
            edit_count,
            next_table_id = state.next_table_id,
            last_sequence = state.last_sequence,
            "Replayed manifest"
        );

        Ok((
            Self {
                path,
                writer: Mutex::new(BufWriter::new(file)),
                next_seq: AtomicU64::new(state.last_edit_seq + 1),
                edit_count: AtomicU64::new(edit_count),
            },
            state,
        ))
    }

    /// Atomically replaces the manifest at `path` with a single snapshot of `state`.
    pub fn write_snapshot(path: &Path, state: &ManifestState) -> Result<Self> {
        let tmp = path.with_extension("tmp");
        {
            let manifest = Self::create(&tmp)?;
            manifest.append(&state.snapshot_edit(1))?;
            manifest.sync()?;
        }
        std::fs::rename(&tmp, path)?;
        sync_parent(path)?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::Start(len))?;

        info!(path = %path.display(), tables = state.table_count(), "Wrote manifest snapshot");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            next_seq: AtomicU64::new(2),
            edit_count: AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn edit_count(&self) -> u64 {
        self.edit_count.load(Ordering::SeqCst)
    }

    pub fn should_snapshot(&self) -> bool {
        self.edit_count() >= SNAPSHOT_THRESHOLD
    }

    pub fn append(&self, edit: &VersionEdit) -> Result<()> {
        let edit_bytes = edit.encode();
        let checksum = CRC32.checksum(&edit_bytes);

        let mut writer = self.writer.lock()?;
        writer.write_u32::<BigEndian>(edit_bytes.len() as u32)?;
        writer.write_all(&edit_bytes)?;
        writer.write_u32::<BigEndian>(checksum)?;

        self.edit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Appends the edits and makes them durable before returning.
    pub fn log_and_sync(&self, edits: &[VersionEdit]) -> Result<()> {
        for edit in edits {
            self.append(edit)?;
        }
        self.sync()
    }
}

/// fsyncs the directory holding `path` so a create or rename survives a crash.
pub(crate) fn sync_parent(path: &Path) -> Result<()> {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// Level layout and watermarks rebuilt from the manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestState {
    pub levels: Vec<LevelMeta>,
    pub next_table_id: u64,
    /// Highest sequence number persisted in tables.
    pub last_sequence: u64,
    /// Highest WAL segment id whose contents are all in tables.
    pub wal_id: u64,
    pub last_edit_seq: u64,
}

impl ManifestState {
    pub fn new() -> Self {
        Self {
            next_table_id: 1,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, edit: VersionEdit) {
        self.last_edit_seq = self.last_edit_seq.max(edit.seq());
        match edit {
            VersionEdit::Snapshot {
                levels,
                next_table_id,
                last_sequence,
                wal_id,
                ..
            } => {
                self.levels.clear();
                for level_meta in levels {
                    let level = level_meta.level;
                    for table in level_meta.tables {
                        self.add_table_at_level(table, level);
                    }
                    self.ensure_level(level);
                }
                self.next_table_id = next_table_id;
                self.last_sequence = last_sequence;
                self.wal_id = wal_id;
            }

            VersionEdit::Flush {
                table,
                wal_id,
                last_sequence,
                ..
            } => {
                self.next_table_id = self.next_table_id.max(table.id + 1);
                self.last_sequence = self.last_sequence.max(last_sequence);
                self.wal_id = self.wal_id.max(wal_id);
                self.add_table_at_level(table, 0);
            }

            VersionEdit::BeginCompaction { .. } => {}

            VersionEdit::CommitCompaction {
                deleted_tables,
                target_level,
                added_tables,
                ..
            } => {
                self.delete_tables(&deleted_tables);
                for table in added_tables {
                    self.next_table_id = self.next_table_id.max(table.id + 1);
                    self.add_table_at_level(table, target_level);
                }
            }
        }
    }

    fn ensure_level(&mut self, level: u32) {
        while self.levels.len() <= level as usize {
            self.levels.push(LevelMeta {
                level: self.levels.len() as u32,
                tables: Vec::new(),
            });
        }
    }

    fn add_table_at_level(&mut self, mut table: TableMeta, level: u32) {
        self.ensure_level(level);
        table.level = level;
        let tables = &mut self.levels[level as usize].tables;
        if level == 0 {
            // Level 0 keeps install order: oldest first.
            tables.push(table);
        } else {
            let pos = tables.partition_point(|t| t.min_key < table.min_key);
            tables.insert(pos, table);
        }
    }

    fn delete_tables(&mut self, table_ids: &[u64]) {
        for level_meta in &mut self.levels {
            level_meta.tables.retain(|t| !table_ids.contains(&t.id));
        }
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(|l| l.tables.len()).sum()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.levels.iter().flat_map(|l| l.tables.iter())
    }

    pub fn snapshot_edit(&self, seq: u64) -> VersionEdit {
        VersionEdit::Snapshot {
            seq,
            levels: self.levels.clone(),
            next_table_id: self.next_table_id,
            last_sequence: self.last_sequence,
            wal_id: self.wal_id,
        }
    }
}

/// Reads framed edits, stopping quietly at a torn tail.
pub struct ManifestIterator {
    reader: BufReader<File>,
    file_len: u64,
    valid_len: u64,
    torn: bool,
    done: bool,
}

impl ManifestIterator {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "manifest {} is shorter than its header",
                path.display()
            )));
        }
        let mut reader = BufReader::new(file);
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        ManifestHeader::decode(&buf)?;

        Ok(Self {
            reader,
            file_len,
            valid_len: HEADER_SIZE as u64,
            torn: false,
            done: false,
        })
    }

    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn is_torn(&self) -> bool {
        self.torn
    }

    fn read_edit(&mut self) -> Result<Option<Vec<u8>>> {
        let remaining = self.file_len - self.valid_len;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < 8 {
            self.torn = true;
            return Ok(None);
        }
        let edit_len = self.reader.read_u32::<BigEndian>()? as u64;
        if edit_len + 8 > remaining {
            self.torn = true;
            return Ok(None);
        }

        let mut edit_bytes = vec![0u8; edit_len as usize];
        self.reader.read_exact(&mut edit_bytes)?;
        let stored_checksum = self.reader.read_u32::<BigEndian>()?;
        if CRC32.checksum(&edit_bytes) != stored_checksum {
            self.torn = true;
            return Ok(None);
        }

        self.valid_len += edit_len + 8;
        Ok(Some(edit_bytes))
    }
}

impl Iterator for ManifestIterator {
    type Item = Result<VersionEdit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_edit() {
            Ok(Some(bytes)) => Some(VersionEdit::decode(&bytes)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_table_meta(id: u64, min: &str, max: &str) -> TableMeta {
        TableMeta {
            id,
            level: 0,
            size: 1024,
            entry_count: 100,
            min_key: min.as_bytes().to_vec(),
            max_key: max.as_bytes().to_vec(),
            min_seq: 1,
            max_seq: 100,
            checksum: id,
        }
    }

    fn flush(manifest: &Manifest, id: u64, wal_id: u64) -> Result<()> {
        manifest.log_and_sync(&[VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(id, "a", "z"),
            wal_id,
            last_sequence: id * 10,
        }])
    }

    #[test]
    fn test_manifest_append_flush() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("MANIFEST");
        let manifest = Manifest::create(&path)?;

        flush(&manifest, 1, 1)?;
        flush(&manifest, 2, 2)?;
        drop(manifest);

        let (manifest, state) = Manifest::open(&path)?;
        let ids: Vec<u64> = state.levels[0].tables.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(state.next_table_id, 3);
        assert_eq!(state.last_sequence, 20);
        assert_eq!(state.wal_id, 2);
        assert_eq!(manifest.next_seq(), 3);
        assert_eq!(manifest.edit_count(), 2);
        Ok(())
    }

    #[test]
    fn test_manifest_two_phase_compaction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("MANIFEST");
        let manifest = Manifest::create(&path)?;
        flush(&manifest, 1, 1)?;
        flush(&manifest, 2, 2)?;

        manifest.log_and_sync(&[
            VersionEdit::BeginCompaction {
                seq: manifest.next_seq(),
                job_id: 1,
                source_level: 0,
                target_level: 1,
            },
            VersionEdit::CommitCompaction {
                seq: manifest.next_seq(),
                job_id: 1,
                source_level: 0,
                deleted_tables: vec![1, 2],
                target_level: 1,
                added_tables: vec![
                    create_test_table_meta(4, "n", "z"),
                    create_test_table_meta(3, "a", "m"),
                ],
            },
        ])?;

        // A compaction that never committed changes nothing.
        manifest.log_and_sync(&[VersionEdit::BeginCompaction {
            seq: manifest.next_seq(),
            job_id: 2,
            source_level: 1,
            target_level: 2,
        }])?;
        drop(manifest);

        let (_, state) = Manifest::open(&path)?;
        assert!(state.levels[0].tables.is_empty());
        let level1: Vec<u64> = state.levels[1].tables.iter().map(|t| t.id).collect();
        assert_eq!(level1, vec![3, 4], "level 1 sorted by key");
        assert!(state.levels[1].tables.iter().all(|t| t.level == 1));
        assert_eq!(state.next_table_id, 5);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("MANIFEST");
        let manifest = Manifest::create(&path)?;
        flush(&manifest, 1, 1)?;
        let intact = std::fs::metadata(&path)?.len();
        flush(&manifest, 2, 2)?;
        drop(manifest);

        let full = std::fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(full - 3)?;
        drop(file);

        let (manifest, state) = Manifest::open(&path)?;
        assert_eq!(state.table_count(), 1);
        assert_eq!(std::fs::metadata(&path)?.len(), intact);

        // Appending after recovery produces a readable log.
        flush(&manifest, 5, 3)?;
        drop(manifest);
        let (_, state) = Manifest::open(&path)?;
        assert_eq!(state.table_count(), 2);
        Ok(())
    }

    #[test]
    fn test_bad_header_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("MANIFEST");
        std::fs::write(&path, vec![0u8; HEADER_SIZE])?;

        assert!(matches!(Manifest::open(&path), Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn test_snapshot_rewrite() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("MANIFEST");
        let manifest = Manifest::create(&path)?;
        for id in 1..=5 {
            flush(&manifest, id, id)?;
        }
        drop(manifest);

        let (_, state) = Manifest::open(&path)?;
        let manifest = Manifest::write_snapshot(&path, &state)?;
        assert_eq!(manifest.edit_count(), 1);
        flush(&manifest, 6, 6)?;
        drop(manifest);

        let (_, reopened) = Manifest::open(&path)?;
        assert_eq!(reopened.table_count(), 6);
        assert_eq!(reopened.wal_id, 6);
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }
}

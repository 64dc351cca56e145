use super::meta::{LevelMeta, TableMeta};
use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const FLUSH: u8 = 0x01;
const BEGIN_COMPACTION: u8 = 0x02;
const COMMIT_COMPACTION: u8 = 0x03;
const SNAPSHOT: u8 = 0x04;

/// One atomic change to the level layout.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionEdit {
    /// A memtable became an L0 table. Every WAL segment up to `wal_id` is
    /// now redundant and `last_sequence` is durable in tables.
    Flush {
        seq: u64,
        table: TableMeta,
        wal_id: u64,
        last_sequence: u64,
    },

    BeginCompaction {
        seq: u64,
        job_id: u64,
        source_level: u32,
        target_level: u32,
    },

    /// Replaces `deleted_tables` (from the source and target levels) with
    /// `added_tables` at the target level.
    CommitCompaction {
        seq: u64,
        job_id: u64,
        source_level: u32,
        deleted_tables: Vec<u64>,
        target_level: u32,
        added_tables: Vec<TableMeta>,
    },

    /// Full layout; replaces everything before it.
    Snapshot {
        seq: u64,
        levels: Vec<LevelMeta>,
        next_table_id: u64,
        last_sequence: u64,
        wal_id: u64,
    },
}

impl VersionEdit {
    pub fn seq(&self) -> u64 {
        match self {
            VersionEdit::Flush { seq, .. }
            | VersionEdit::BeginCompaction { seq, .. }
            | VersionEdit::CommitCompaction { seq, .. }
            | VersionEdit::Snapshot { seq, .. } => *seq,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            VersionEdit::Flush {
                seq,
                table,
                wal_id,
                last_sequence,
            } => {
                buf.write_u8(FLUSH).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u64::<BigEndian>(*wal_id).unwrap();
                buf.write_u64::<BigEndian>(*last_sequence).unwrap();
                table.encode_into(&mut buf);
            }

            VersionEdit::BeginCompaction {
                seq,
                job_id,
                source_level,
                target_level,
            } => {
                buf.write_u8(BEGIN_COMPACTION).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u64::<BigEndian>(*job_id).unwrap();
                buf.write_u32::<BigEndian>(*source_level).unwrap();
                buf.write_u32::<BigEndian>(*target_level).unwrap();
            }

            VersionEdit::CommitCompaction {
                seq,
                job_id,
                source_level,
                deleted_tables,
                target_level,
                added_tables,
            } => {
                buf.write_u8(COMMIT_COMPACTION).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u64::<BigEndian>(*job_id).unwrap();
                buf.write_u32::<BigEndian>(*source_level).unwrap();

                buf.write_u32::<BigEndian>(deleted_tables.len() as u32)
                    .unwrap();
                for id in deleted_tables {
                    buf.write_u64::<BigEndian>(*id).unwrap();
                }

                buf.write_u32::<BigEndian>(*target_level).unwrap();

                buf.write_u32::<BigEndian>(added_tables.len() as u32)
                    .unwrap();
                for table in added_tables {
                    table.encode_into(&mut buf);
                }
            }

            VersionEdit::Snapshot {
                seq,
                levels,
                next_table_id,
                last_sequence,
                wal_id,
            } => {
                buf.write_u8(SNAPSHOT).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u64::<BigEndian>(*next_table_id).unwrap();
                buf.write_u64::<BigEndian>(*last_sequence).unwrap();
                buf.write_u64::<BigEndian>(*wal_id).unwrap();

                buf.write_u32::<BigEndian>(levels.len() as u32).unwrap();
                for level in levels {
                    level.encode_into(&mut buf);
                }
            }
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let edit_type = cursor
            .read_u8()
            .map_err(|e| Error::Decode("edit type", e))?;

        let edit = match edit_type {
            FLUSH => {
                let seq = read_u64(&mut cursor)?;
                let wal_id = read_u64(&mut cursor)?;
                let last_sequence = read_u64(&mut cursor)?;
                let table = TableMeta::decode_from(&mut cursor)?;
                VersionEdit::Flush {
                    seq,
                    table,
                    wal_id,
                    last_sequence,
                }
            }

            BEGIN_COMPACTION => {
                let seq = read_u64(&mut cursor)?;
                let job_id = read_u64(&mut cursor)?;
                let source_level = read_u32(&mut cursor)?;
                let target_level = read_u32(&mut cursor)?;
                VersionEdit::BeginCompaction {
                    seq,
                    job_id,
                    source_level,
                    target_level,
                }
            }

            COMMIT_COMPACTION => {
                let seq = read_u64(&mut cursor)?;
                let job_id = read_u64(&mut cursor)?;
                let source_level = read_u32(&mut cursor)?;

                let deleted_count = read_u32(&mut cursor)? as usize;
                let mut deleted_tables = Vec::with_capacity(deleted_count.min(1024));
                for _ in 0..deleted_count {
                    deleted_tables.push(read_u64(&mut cursor)?);
                }

                let target_level = read_u32(&mut cursor)?;

                let added_count = read_u32(&mut cursor)? as usize;
                let mut added_tables = Vec::with_capacity(added_count.min(1024));
                for _ in 0..added_count {
                    added_tables.push(TableMeta::decode_from(&mut cursor)?);
                }

                VersionEdit::CommitCompaction {
                    seq,
                    job_id,
                    source_level,
                    deleted_tables,
                    target_level,
                    added_tables,
                }
            }

            SNAPSHOT => {
                let seq = read_u64(&mut cursor)?;
                let next_table_id = read_u64(&mut cursor)?;
                let last_sequence = read_u64(&mut cursor)?;
                let wal_id = read_u64(&mut cursor)?;

                let level_count = read_u32(&mut cursor)? as usize;
                let mut levels = Vec::with_capacity(level_count.min(64));
                for _ in 0..level_count {
                    levels.push(LevelMeta::decode_from(&mut cursor)?);
                }

                VersionEdit::Snapshot {
                    seq,
                    levels,
                    next_table_id,
                    last_sequence,
                    wal_id,
                }
            }

            _ => {
                return Err(Error::Corruption(format!(
                    "invalid edit type: {}",
                    edit_type
                )))
            }
        };

        if cursor.position() as usize != buf.len() {
            return Err(Error::Corruption("trailing bytes after version edit".into()));
        }
        Ok(edit)
    }
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|e| Error::Decode("version edit", e))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Decode("version edit", e))
}

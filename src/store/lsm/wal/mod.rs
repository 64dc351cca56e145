//! Write-Ahead Log (WAL) for durability and recovery.
//!
//! Every write batch is appended to the WAL before it is applied to the
//! memtable. A WAL segment belongs to exactly one memtable; when the memtable
//! is frozen its segment is rotated and a new one is started.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | Record 2         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +-----------+---------------+-----------+
//! |  len:u32  |    payload    | crc32:u32 |
//! +-----------+---------------+-----------+
//! ```
//!
//! The payload is one encoded write batch. Integers are big-endian and the
//! checksum is CRC-32/ISCSI over the payload.
//!
//! # Durability
//!
//! Records appended without `sync` are pushed to the OS but not fsynced. The
//! next synced append (or an explicit [`Wal::sync`]) makes every pending
//! record durable with a single fsync.

pub mod header;
pub mod recovery;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use header::{Header, HEADER_SIZE};

use crate::error::Result;
use crate::Error;

use super::batch::WriteBatch;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Bytes of framing around each record payload.
pub const RECORD_OVERHEAD: u64 = 8;

/// Upper bound on a single record payload. Replay treats longer lengths as
/// garbage, so writers must never produce them.
pub const MAX_RECORD_SIZE: usize = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalState {
    /// Created or reopened, nothing appended yet.
    Open,
    /// Records appended since the last fsync.
    Appending,
    /// Every appended record is durable.
    Synced,
    /// No longer the active segment; read-only.
    Rotated,
    Closed,
}

struct Inner {
    writer: BufWriter<File>,
    state: WalState,
    /// Bytes handed to the OS, header included.
    len: u64,
    /// Bytes known to be durable.
    synced_len: u64,
}

pub struct Wal {
    id: u64,
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl Wal {
    /// Creates a fresh segment, writing and syncing its header.
    pub fn create(path: impl Into<PathBuf>, id: u64, buffer_size: usize) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        file.write_all(&Header::new(id).encode())?;
        file.sync_all()?;

        Ok(Self {
            id,
            path,
            inner: Mutex::new(Inner {
                writer: BufWriter::with_capacity(buffer_size, file),
                state: WalState::Open,
                len: HEADER_SIZE as u64,
                synced_len: HEADER_SIZE as u64,
            }),
        })
    }

    /// Reopens an existing segment for appending after `valid_len` bytes.
    /// Anything beyond `valid_len` is cut off.
    pub fn open_for_append(
        path: impl Into<PathBuf>,
        id: u64,
        valid_len: u64,
        buffer_size: usize,
    ) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        Ok(Self {
            id,
            path,
            inner: Mutex::new(Inner {
                writer: BufWriter::with_capacity(buffer_size, file),
                state: WalState::Open,
                len: valid_len,
                synced_len: valid_len,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written to the OS so far. A reader copying this many bytes sees
    /// only complete records.
    pub fn len(&self) -> u64 {
        self.inner.lock().map(|inner| inner.len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= HEADER_SIZE as u64
    }

    pub fn state(&self) -> WalState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(WalState::Closed)
    }

    /// Appends one batch as a single record.
    pub fn append(&self, base_seq: u64, batch: &WriteBatch, sync: bool) -> Result<()> {
        let payload = batch.encode(base_seq);
        self.append_record(&payload, sync)
    }

    fn append_record(&self, payload: &[u8], sync: bool) -> Result<()> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(Error::InvalidArgument(format!(
                "WAL record of {} bytes exceeds {MAX_RECORD_SIZE}",
                payload.len()
            )));
        }
        let checksum = CRC32.checksum(payload);

        let mut inner = self.inner.lock()?;
        match inner.state {
            WalState::Rotated | WalState::Closed => {
                return Err(Error::InvalidState(format!(
                    "append to {:?} WAL {}",
                    inner.state, self.id
                )))
            }
            WalState::Open | WalState::Appending | WalState::Synced => {}
        }

        inner.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        inner.writer.write_all(payload)?;
        inner.writer.write_u32::<BigEndian>(checksum)?;
        inner.writer.flush()?;
        inner.len += payload.len() as u64 + RECORD_OVERHEAD;
        inner.state = WalState::Appending;

        if sync {
            Self::sync_inner(&mut inner)?;
        }
        Ok(())
    }

    /// Makes every record appended so far durable.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        Self::sync_inner(&mut inner)
    }

    fn sync_inner(inner: &mut Inner) -> Result<()> {
        if inner.synced_len == inner.len {
            return Ok(());
        }
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        inner.synced_len = inner.len;
        if inner.state == WalState::Appending {
            inner.state = WalState::Synced;
        }
        Ok(())
    }

    /// Syncs and retires the segment; later appends fail.
    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        Self::sync_inner(&mut inner)?;
        if inner.state != WalState::Closed {
            inner.state = WalState::Rotated;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        Self::sync_inner(&mut inner)?;
        inner.state = WalState::Closed;
        Ok(())
    }

    /// Replays the segment at `path`.
    pub fn replay(path: &Path) -> Result<ReplayIterator> {
        ReplayIterator::new(path)
    }
}

/// Why replay stopped before the end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TornTail {
    ShortRecord,
    ChecksumMismatch,
    OversizedRecord(usize),
}

/// Iterates the batches of a WAL segment, stopping at the first torn record.
pub struct ReplayIterator {
    reader: BufReader<File>,
    file_len: u64,
    valid_len: u64,
    torn: Option<TornTail>,
    header: Option<Header>,
    done: bool,
}

impl ReplayIterator {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        // A segment whose header never made it to disk holds no records.
        if file_len < HEADER_SIZE as u64 {
            return Ok(Self {
                reader,
                file_len,
                valid_len: 0,
                torn: (file_len > 0).then_some(TornTail::ShortRecord),
                header: None,
                done: true,
            });
        }

        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        let header = Header::decode(&buf)?;

        Ok(Self {
            reader,
            file_len,
            valid_len: HEADER_SIZE as u64,
            torn: None,
            header: Some(header),
            done: false,
        })
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Length of the prefix made of intact records.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Set once replay has met a short or corrupt trailing record.
    pub fn torn_tail(&self) -> Option<&TornTail> {
        self.torn.as_ref()
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let remaining = self.file_len - self.valid_len;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < RECORD_OVERHEAD {
            self.torn = Some(TornTail::ShortRecord);
            return Ok(None);
        }

        let record_len = self.reader.read_u32::<BigEndian>()? as usize;
        if record_len > MAX_RECORD_SIZE {
            self.torn = Some(TornTail::OversizedRecord(record_len));
            return Ok(None);
        }
        if (record_len as u64) + RECORD_OVERHEAD > remaining {
            self.torn = Some(TornTail::ShortRecord);
            return Ok(None);
        }

        let mut payload = vec![0u8; record_len];
        self.reader.read_exact(&mut payload)?;
        let stored_crc = self.reader.read_u32::<BigEndian>()?;

        if CRC32.checksum(&payload) != stored_crc {
            self.torn = Some(TornTail::ChecksumMismatch);
            return Ok(None);
        }

        self.valid_len += record_len as u64 + RECORD_OVERHEAD;
        Ok(Some(payload))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<(u64, WriteBatch)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(payload)) => Some(WriteBatch::decode(&payload)),
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
    use tempfile::TempDir;

    fn create_temp_wal() -> (TempDir, Wal) {
        let dir = tempfile::tempdir().expect("Failed to create temporary dir");
        let wal = Wal::create(dir.path().join("000001.wal"), 1, 4096)
            .expect("Failed to initialize WAL");
        (dir, wal)
    }

    fn batch(ops: &[(&str, Option<&str>)]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (key, value) in ops {
            match value {
                Some(value) => batch.put(key.as_bytes(), value.as_bytes()),
                None => batch.delete(key.as_bytes()),
            };
        }
        batch
    }

    #[test]
    fn test_append_and_replay() -> Result<()> {
        let (_dir, wal) = create_temp_wal();

        wal.append(1, &batch(&[("key1", Some("value1"))]), false)?;
        wal.append(2, &batch(&[("key1", None), ("key2", Some("value2"))]), true)?;
        assert_eq!(wal.state(), WalState::Synced);

        let mut replay = Wal::replay(wal.path())?;
        let entries: Vec<_> = replay.by_ref().collect::<Result<Vec<_>>>()?;

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 1);
        assert_eq!(entries[1].0, 2);
        assert_eq!(entries[1].1.len(), 2);
        assert_eq!(replay.valid_len(), wal.len());
        assert!(replay.torn_tail().is_none());
        assert_eq!(replay.header().map(|h| h.wal_id), Some(1));
        Ok(())
    }

    #[test]
    fn test_empty_replay() -> Result<()> {
        let (_dir, wal) = create_temp_wal();
        assert!(wal.is_empty());

        let replay = Wal::replay(wal.path())?;
        assert_eq!(replay.count(), 0);
        Ok(())
    }

    #[test]
    fn test_torn_tail_stops_replay() -> Result<()> {
        let (_dir, wal) = create_temp_wal();
        wal.append(1, &batch(&[("key1", Some("value1"))]), false)?;
        let intact = wal.len();
        wal.append(2, &batch(&[("key2", Some("value2"))]), true)?;
        let full = wal.len();
        wal.close()?;

        // Chop the last record in half.
        let file = OpenOptions::new().write(true).open(wal.path())?;
        file.set_len(intact + (full - intact) / 2)?;

        let mut replay = Wal::replay(wal.path())?;
        let entries: Vec<_> = replay.by_ref().collect::<Result<Vec<_>>>()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(replay.valid_len(), intact);
        assert_eq!(replay.torn_tail(), Some(&TornTail::ShortRecord));
        Ok(())
    }

    #[test]
    fn test_corrupted_record_detected() -> Result<()> {
        let (_dir, wal) = create_temp_wal();
        wal.append(1, &batch(&[("key1", Some("value1"))]), false)?;
        wal.append(2, &batch(&[("key2", Some("value2"))]), true)?;
        wal.close()?;

        let mut file = OpenOptions::new().write(true).open(wal.path())?;
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 6))?;
        file.write_all(b"garbage")?;
        file.sync_all()?;

        let mut replay = Wal::replay(wal.path())?;
        assert_eq!(replay.by_ref().count(), 0);
        assert_eq!(replay.valid_len(), HEADER_SIZE as u64);
        assert_eq!(replay.torn_tail(), Some(&TornTail::ChecksumMismatch));
        Ok(())
    }

    #[test]
    fn test_append_after_rotate_fails() -> Result<()> {
        let (_dir, wal) = create_temp_wal();
        wal.append(1, &batch(&[("key1", Some("value1"))]), false)?;
        wal.rotate()?;
        assert_eq!(wal.state(), WalState::Rotated);

        let err = wal
            .append(2, &batch(&[("key2", Some("value2"))]), false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        Ok(())
    }

    #[test]
    fn test_reopen_for_append_truncates() -> Result<()> {
        let (dir, wal) = create_temp_wal();
        wal.append(1, &batch(&[("key1", Some("value1"))]), true)?;
        let valid = wal.len();
        let path = wal.path().to_path_buf();
        drop(wal);

        // Garbage after the last intact record.
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0xde, 0xad])?;
        drop(file);

        let wal = Wal::open_for_append(&path, 1, valid, 4096)?;
        wal.append(2, &batch(&[("key2", Some("value2"))]), true)?;

        let entries: Vec<_> = Wal::replay(&path)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].0, 2);
        drop(dir);
        Ok(())
    }
}

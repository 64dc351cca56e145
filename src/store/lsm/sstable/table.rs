//! Writing and reading SSTable files.
//!
//! ## File Layout
//!
//! ```text
//! +-------------------------+
//! | Data Block 1 | crc32    |
//! +-------------------------+
//! | ...                     |
//! +-------------------------+
//! | Data Block N | crc32    |
//! +-------------------------+
//! | Filter Block | crc32    |
//! +-------------------------+
//! | Index Block  | crc32    |
//! +-------------------------+
//! | Footer (40 bytes)       |
//! +-------------------------+
//! ```
//!
//! The footer holds the filter and index handles followed by a magic number.
//! Block checksums are CRC-32/ISCSI. The CRC-64 of the whole file is computed
//! while writing and recorded in the manifest as the table's fingerprint.

use super::block::{Block, BlockIterator, Builder};
use super::filter::{hash_key, BloomFilter};
use super::index::{BlockHandle, Index};
use crate::error::Result;
use crate::hasher::HashingWriter;
use crate::store::lsm::iterator::Entry;
use crate::store::lsm::key::{self, InternalKey, ValueKind, MAX_SEQUENCE};
use crate::store::lsm::manifest::TableMeta;
use crate::store::lsm::wal::CRC32;
use crate::Error;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::ops::Bound;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const FOOTER_SIZE: u64 = 40;
const TABLE_MAGIC: u64 = 0x4349_4e44_4552_5354; // "CINDERST"
const CHECKSUM_SIZE: u64 = 4;

/// Builds a new SSTable from entries supplied in internal-key order.
pub struct TableBuilder {
    id: u64,
    level: u32,
    path: PathBuf,
    writer: HashingWriter<BufWriter<File>>,
    block_size: usize,
    bloom_bits_per_key: usize,
    block: Builder,
    index: Index,
    key_hashes: Vec<u128>,
    offset: u64,
    entry_count: u64,
    min_key: Option<Vec<u8>>,
    max_key: Vec<u8>,
    min_seq: u64,
    max_seq: u64,
}

impl TableBuilder {
    pub fn create(
        path: impl Into<PathBuf>,
        id: u64,
        level: u32,
        block_size: usize,
        bloom_bits_per_key: usize,
    ) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            id,
            level,
            path,
            writer: HashingWriter::new(BufWriter::new(file)),
            block_size,
            bloom_bits_per_key,
            block: Builder::new(),
            index: Index::new(),
            key_hashes: Vec::new(),
            offset: 0,
            entry_count: 0,
            min_key: None,
            max_key: Vec::new(),
            min_seq: u64::MAX,
            max_seq: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds one version. `None` values are tombstones.
    pub fn add(&mut self, key: &InternalKey, value: Option<&[u8]>) -> Result<()> {
        let kind = if value.is_some() {
            ValueKind::Put
        } else {
            ValueKind::Delete
        };

        if self.min_key.is_none() {
            self.min_key = Some(key.user_key.clone());
        }
        if self.entry_count == 0 || self.max_key != key.user_key {
            if self.bloom_bits_per_key > 0 {
                self.key_hashes.push(hash_key(&key.user_key));
            }
            self.max_key.clear();
            self.max_key.extend_from_slice(&key.user_key);
        }
        self.min_seq = self.min_seq.min(key.seq);
        self.max_seq = self.max_seq.max(key.seq);
        self.entry_count += 1;

        self.block.add_entry(&key.encode(kind), value.unwrap_or_default());
        if self.block.estimated_size() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Bytes written so far plus the pending block.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.estimated_size() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let builder = std::mem::replace(&mut self.block, Builder::new());
        let last_key = builder.last_key().to_vec();
        let data = builder.finish();
        let handle = self.write_checksummed(&data)?;
        self.index.push(last_key, handle);
        Ok(())
    }

    fn write_checksummed(&mut self, data: &[u8]) -> Result<BlockHandle> {
        let handle = BlockHandle {
            offset: self.offset,
            size: data.len() as u64,
        };
        self.writer.write_all(data)?;
        self.writer.write_u32::<BigEndian>(CRC32.checksum(data))?;
        self.offset += data.len() as u64 + CHECKSUM_SIZE;
        Ok(handle)
    }

    /// Writes the filter, index and footer, syncs the file and returns its metadata.
    pub fn finish(mut self) -> Result<TableMeta> {
        if self.entry_count == 0 {
            return Err(Error::InvalidState("cannot finish an empty table".into()));
        }
        self.flush_block()?;

        let filter = if self.bloom_bits_per_key > 0 {
            BloomFilter::from_hashes(&self.key_hashes, self.bloom_bits_per_key).encode()
        } else {
            Vec::new()
        };
        let filter_handle = self.write_checksummed(&filter)?;
        let index = self.index.encode();
        let index_handle = self.write_checksummed(&index)?;

        self.writer.write_u64::<BigEndian>(filter_handle.offset)?;
        self.writer.write_u64::<BigEndian>(filter_handle.size)?;
        self.writer.write_u64::<BigEndian>(index_handle.offset)?;
        self.writer.write_u64::<BigEndian>(index_handle.size)?;
        self.writer.write_u64::<BigEndian>(TABLE_MAGIC)?;
        self.writer.flush()?;
        self.offset += FOOTER_SIZE;

        let (writer, checksum) = self.writer.finish();
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(TableMeta {
            id: self.id,
            level: self.level,
            size: self.offset,
            entry_count: self.entry_count,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key,
            min_seq: self.min_seq,
            max_seq: self.max_seq,
            checksum,
        })
    }

    /// Drops a partially written table and its file.
    pub fn abandon(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// An open, immutable SSTable.
pub struct Table {
    id: u64,
    path: PathBuf,
    file: File,
    size: u64,
    index: Index,
    filter: Option<BloomFilter>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

impl Table {
    /// Opens a table and loads its index and filter into memory.
    pub fn open(path: impl Into<PathBuf>, id: u64) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "table {} is too short ({size} bytes)",
                path.display()
            )));
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact_at(&mut footer, size - FOOTER_SIZE)?;
        if BigEndian::read_u64(&footer[32..40]) != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic in {}",
                path.display()
            )));
        }
        let filter_handle = BlockHandle {
            offset: BigEndian::read_u64(&footer[0..8]),
            size: BigEndian::read_u64(&footer[8..16]),
        };
        let index_handle = BlockHandle {
            offset: BigEndian::read_u64(&footer[16..24]),
            size: BigEndian::read_u64(&footer[24..32]),
        };

        let mut table = Self {
            id,
            path,
            file,
            size,
            index: Index::new(),
            filter: None,
        };

        table.index = Index::decode(&table.read_checksummed(index_handle)?)?;
        if filter_handle.size > 0 {
            table.filter = Some(BloomFilter::decode(&table.read_checksummed(filter_handle)?)?);
        }
        Ok(table)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn read_checksummed(&self, handle: BlockHandle) -> Result<Vec<u8>> {
        if handle.offset + handle.size + CHECKSUM_SIZE > self.size {
            return Err(Error::Corruption(format!(
                "block at {} overruns {}",
                handle.offset,
                self.path.display()
            )));
        }
        let mut buf = vec![0u8; (handle.size + CHECKSUM_SIZE) as usize];
        self.file.read_exact_at(&mut buf, handle.offset)?;
        let data_len = handle.size as usize;
        let stored = BigEndian::read_u32(&buf[data_len..]);
        buf.truncate(data_len);
        if CRC32.checksum(&buf) != stored {
            return Err(Error::Corruption(format!(
                "block checksum mismatch at offset {} in {}",
                handle.offset,
                self.path.display()
            )));
        }
        Ok(buf)
    }

    fn read_block(&self, index: usize) -> Result<Option<Arc<Block>>> {
        match self.index.handle(index) {
            Some(handle) => Ok(Some(Arc::new(Block::new(self.read_checksummed(handle)?)?))),
            None => Ok(None),
        }
    }

    /// False when the bloom filter rules the key out.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.filter.as_ref().map_or(true, |f| f.may_contain(key))
    }

    /// Newest version of `key` with sequence <= `seq`.
    pub fn get(&self, key: &[u8], seq: u64) -> Result<Option<Option<Vec<u8>>>> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        let target = InternalKey::seek(key, seq.min(MAX_SEQUENCE)).encode(ValueKind::Put);
        let Some(block_index) = self.index.find(&target) else {
            return Ok(None);
        };
        let Some(block) = self.read_block(block_index)? else {
            return Ok(None);
        };

        let mut iter = block.iter();
        iter.seek(&target)?;
        match iter.next() {
            Some(Ok((found, value))) => {
                let (user_key, _, kind) = key::split(&found)?;
                if user_key != key {
                    return Ok(None);
                }
                Ok(Some(match kind {
                    ValueKind::Put => Some(value),
                    ValueKind::Delete => None,
                }))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Iterates every version whose user key is within the bounds.
    pub fn iter(self: &Arc<Self>, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> TableIterator {
        TableIterator {
            table: Arc::clone(self),
            next_block: 0,
            block_iter: None,
            start,
            end,
            positioned: false,
            done: false,
        }
    }
}

/// Owned iterator over a table, loading one block at a time.
pub struct TableIterator {
    table: Arc<Table>,
    next_block: usize,
    block_iter: Option<BlockIterator>,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    positioned: bool,
    done: bool,
}

impl TableIterator {
    /// Loads the first block that may hold the start bound and seeks into it.
    fn position(&mut self) -> Result<()> {
        self.positioned = true;
        let target = match &self.start {
            Bound::Included(k) | Bound::Excluded(k) => {
                InternalKey::seek(k, MAX_SEQUENCE).encode(ValueKind::Put)
            }
            Bound::Unbounded => return Ok(()),
        };
        let Some(block_index) = self.table.index.find(&target) else {
            self.done = true;
            return Ok(());
        };
        if let Some(block) = self.table.read_block(block_index)? {
            let mut iter = block.iter();
            iter.seek(&target)?;
            self.block_iter = Some(iter);
        }
        self.next_block = block_index + 1;
        Ok(())
    }

    fn before_start(&self, user_key: &[u8]) -> bool {
        match &self.start {
            Bound::Excluded(start) => user_key <= start.as_slice(),
            Bound::Included(start) => user_key < start.as_slice(),
            Bound::Unbounded => false,
        }
    }

    fn past_end(&self, user_key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => user_key > end.as_slice(),
            Bound::Excluded(end) => user_key >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }

    fn next_raw(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if let Some(iter) = &mut self.block_iter {
                if let Some(entry) = iter.next() {
                    return entry.map(Some);
                }
            }
            match self.table.read_block(self.next_block)? {
                Some(block) => {
                    self.block_iter = Some(block.iter());
                    self.next_block += 1;
                }
                None => return Ok(None),
            }
        }
    }
}

impl Iterator for TableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.positioned {
            if let Err(e) = self.position() {
                self.done = true;
                return Some(Err(e));
            }
            if self.done {
                return None;
            }
        }

        loop {
            let (encoded, value) = match self.next_raw() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let (internal, kind) = match InternalKey::decode(&encoded) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if self.before_start(&internal.user_key) {
                continue;
            }
            if self.past_end(&internal.user_key) {
                self.done = true;
                return None;
            }
            let value = match kind {
                ValueKind::Put => Some(value),
                ValueKind::Delete => None,
            };
            return Some(Ok((internal, value)));
        }
    }
}

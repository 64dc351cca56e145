//! Block index of an SSTable.
//!
//! One entry per data block, holding the block's last internal key and its
//! handle. The first block whose last key is >= a target is the only block
//! that can hold the target.

use std::cmp::Ordering;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::store::lsm::key::compare_encoded;
use crate::Error;

/// Location of a data block; `size` excludes the block's checksum trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: Vec<(Vec<u8>, BlockHandle)>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, last_key: Vec<u8>, handle: BlockHandle) {
        self.entries.push((last_key, handle));
    }

    /// Position of the block that may contain `target`, if any.
    pub fn find(&self, target: &[u8]) -> Option<usize> {
        let idx = self
            .entries
            .partition_point(|(last, _)| compare_encoded(last, target) == Ordering::Less);
        (idx < self.entries.len()).then_some(idx)
    }

    pub fn handle(&self, index: usize) -> Option<BlockHandle> {
        self.entries.get(index).map(|(_, handle)| *handle)
    }

    /// `count: u32 | (key_len: u16 | key | offset: u64 | size: u64)*`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.entries.len() as u32)
            .unwrap();
        for (key, handle) in &self.entries {
            buf.write_u16::<BigEndian>(key.len() as u16).unwrap();
            buf.extend_from_slice(key);
            buf.write_u64::<BigEndian>(handle.offset).unwrap();
            buf.write_u64::<BigEndian>(handle.size).unwrap();
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let count = data
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("index count", e))? as usize;

        let mut entries = Vec::with_capacity(count.min(data.len() / 18));
        for _ in 0..count {
            let key_len = data
                .read_u16::<BigEndian>()
                .map_err(|e| Error::Decode("index key length", e))? as usize;
            if data.len() < key_len + 16 {
                return Err(Error::Corruption("index entry out of bounds".into()));
            }
            let (key, rest) = data.split_at(key_len);
            let key = key.to_vec();
            data = rest;
            let offset = data
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("index offset", e))?;
            let size = data
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("index size", e))?;
            entries.push((key, BlockHandle { offset, size }));
        }

        if !data.is_empty() {
            return Err(Error::Corruption("trailing bytes after index".into()));
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lsm::key::{InternalKey, ValueKind};

    fn ikey(key: &str, seq: u64) -> Vec<u8> {
        InternalKey::new(key.as_bytes().to_vec(), seq).encode(ValueKind::Put)
    }

    fn index() -> Index {
        let mut index = Index::new();
        index.push(ikey("c", 5), BlockHandle { offset: 0, size: 100 });
        index.push(ikey("f", 9), BlockHandle { offset: 104, size: 100 });
        index.push(ikey("k", 1), BlockHandle { offset: 208, size: 50 });
        index
    }

    #[test]
    fn test_find() {
        let index = index();
        assert_eq!(index.find(&ikey("a", 100)), Some(0));
        assert_eq!(index.find(&ikey("c", 9)), Some(0));
        // (c, 3) sorts after (c, 5), so it can only live in the next block.
        assert_eq!(index.find(&ikey("c", 3)), Some(1));
        assert_eq!(index.find(&ikey("g", 1)), Some(2));
        assert_eq!(index.find(&ikey("z", 1)), None);
    }

    #[test]
    fn test_encode_decode() {
        let index = index();
        let decoded = Index::decode(&index.encode()).unwrap();
        assert_eq!(decoded.entries.len(), 3);
        assert_eq!(decoded.handle(1), Some(BlockHandle { offset: 104, size: 100 }));
        assert_eq!(decoded.handle(3), None);
        assert_eq!(
            decoded.entries.last().map(|(key, _)| key.as_slice()),
            Some(ikey("k", 1).as_slice())
        );

        let encoded = index.encode();
        assert!(Index::decode(&encoded[..encoded.len() - 3]).is_err());
    }
}

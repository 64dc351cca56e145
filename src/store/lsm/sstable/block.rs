use std::cmp::Ordering;
use std::io;
use std::sync::Arc;

use crate::store::lsm::key::compare_encoded;
use crate::{error::Result, Error};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const RESTART_INTERVAL: usize = 16;

/// Accumulates sorted entries into one prefix-compressed block.
///
/// Keys are encoded internal keys and must be added in internal-key order.
pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let shared_prefix_len = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };

        let unshared_key_len = key.len() - shared_prefix_len;

        self.buffer
            .write_u16::<BigEndian>(shared_prefix_len as u16)
            .unwrap();
        self.buffer
            .write_u16::<BigEndian>(unshared_key_len as u16)
            .unwrap();
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .unwrap();
        self.buffer.extend_from_slice(&key[shared_prefix_len..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    /// Appends the restart array and returns the encoded block.
    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    /// Estimated encoded size once finished.
    pub fn estimated_size(&self) -> usize {
        self.buffer.len() + 4 * (self.restart_positions.len() + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .zip(b.iter())
        .take_while(|&(a, b)| a == b)
        .count()
        .min(u16::MAX as usize)
}

/// A decoded data block.
#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(mut data: Vec<u8>) -> Result<Self> {
        let data_len = data.len();
        if data_len < 4 {
            return Err(Error::Decode(
                "block data",
                io::Error::new(io::ErrorKind::UnexpectedEof, "Data too short"),
            ));
        }

        let num_restarts_offset = data_len - 4;
        let num_restarts = (&data[num_restarts_offset..])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("block restart count", e))? as usize;

        let restart_array_size = num_restarts * 4;
        if num_restarts_offset < restart_array_size {
            return Err(Error::Corruption(
                "block too short for its restart array".into(),
            ));
        }

        let restart_array_offset = num_restarts_offset - restart_array_size;
        let mut restarts = &data[restart_array_offset..num_restarts_offset];
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for _ in 0..num_restarts {
            let pos = restarts
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Decode("block restart", e))?;
            if pos as usize >= restart_array_offset {
                return Err(Error::Corruption("restart point out of bounds".into()));
            }
            restart_positions.push(pos);
        }

        data.truncate(restart_array_offset);
        Ok(Self {
            data,
            restart_positions,
        })
    }

    pub fn iter(self: Arc<Self>) -> BlockIterator {
        BlockIterator::new(self)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Iterates the entries of a block in key order.
pub struct BlockIterator {
    block: Arc<Block>,
    current_offset: usize,
    last_key: Vec<u8>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            current_offset: 0,
            last_key: Vec::new(),
        }
    }

    /// Reads the full key stored at a restart point.
    fn restart_key(&self, restart: usize) -> Result<&[u8]> {
        let data = &self.block.data;
        let mut pos = self.block.restart_positions[restart] as usize;
        if pos + 8 > data.len() {
            return Err(Error::Corruption("restart entry out of bounds".into()));
        }

        let shared_len = (&data[pos..])
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("shared_len", e))? as usize;
        let unshared_len = (&data[pos + 2..])
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("unshared_len", e))? as usize;
        pos += 8;

        if shared_len != 0 {
            return Err(Error::Corruption(
                "restart point key has a shared prefix".into(),
            ));
        }
        if pos + unshared_len > data.len() {
            return Err(Error::Corruption("restart key out of bounds".into()));
        }
        Ok(&data[pos..pos + unshared_len])
    }

    /// Positions the iterator so that the next call to `next()` returns the
    /// first entry whose key is >= `target` in internal-key order.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Last restart whose key is < target.
        let mut left = 0;
        let mut right = self.block.restart_positions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            match compare_encoded(self.restart_key(mid)?, target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart_index = left.saturating_sub(1);

        self.current_offset = self
            .block
            .restart_positions
            .get(restart_index)
            .map_or(self.block.data.len(), |&p| p as usize);
        self.last_key.clear();

        loop {
            let offset = self.current_offset;
            let saved_key = self.last_key.clone();
            match self.next() {
                None => return Ok(()),
                Some(Err(e)) => return Err(e),
                Some(Ok((key, _))) => {
                    if compare_encoded(&key, target) != Ordering::Less {
                        self.current_offset = offset;
                        self.last_key = saved_key;
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Iterator for BlockIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_offset >= self.block.data.len() {
            return None;
        }

        let mut pos = self.current_offset;
        let data = &self.block.data;

        macro_rules! try_read {
            ($expr:expr, $field:expr) => {
                match $expr {
                    Ok(val) => val,
                    Err(e) => return Some(Err(Error::Decode($field, e))),
                }
            };
        }

        let shared_len = try_read!((&data[pos..]).read_u16::<BigEndian>(), "shared_len") as usize;
        pos += 2;
        let unshared_len =
            try_read!((&data[pos..]).read_u16::<BigEndian>(), "unshared_len") as usize;
        pos += 2;
        let value_len = try_read!((&data[pos..]).read_u32::<BigEndian>(), "value_len") as usize;
        pos += 4;

        if shared_len > self.last_key.len() || pos + unshared_len + value_len > data.len() {
            self.current_offset = data.len();
            return Some(Err(Error::Corruption("block entry out of bounds".into())));
        }

        let mut key = Vec::with_capacity(shared_len + unshared_len);
        key.extend_from_slice(&self.last_key[..shared_len]);
        key.extend_from_slice(&data[pos..pos + unshared_len]);
        pos += unshared_len;

        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        self.current_offset = pos;
        self.last_key.clear();
        self.last_key.extend_from_slice(&key);

        Some(Ok((key, value)))
    }
}

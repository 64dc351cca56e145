use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::key::{ValueKind, TRAILER_SIZE};
use super::wal::MAX_RECORD_SIZE;
use crate::error::{Error, Result};

/// Encoded internal keys must fit the u16 length fields of table blocks.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize - TRAILER_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            BatchOp::Put { value, .. } => Some(value),
            BatchOp::Delete { .. } => None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            BatchOp::Put { .. } => ValueKind::Put,
            BatchOp::Delete { .. } => ValueKind::Delete,
        }
    }
}

/// An ordered group of writes applied atomically.
///
/// Each operation receives its own sequence number; the batch as a whole
/// occupies a contiguous range starting at the base sequence assigned on write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        let (key, value) = (key.into(), value.into());
        self.size += key.len() + value.len();
        self.ops.push(BatchOp::Put { key, value });
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        let key = key.into();
        self.size += key.len();
        self.ops.push(BatchOp::Delete { key });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Key and value bytes carried by the batch.
    pub fn approximate_size(&self) -> usize {
        self.size
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.size = 0;
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ops.iter().any(|op| op.key().is_empty()) {
            return Err(Error::InvalidArgument("keys must not be empty".into()));
        }
        if self.ops.iter().any(|op| op.key().len() > MAX_KEY_SIZE) {
            return Err(Error::InvalidArgument(format!(
                "keys must be at most {MAX_KEY_SIZE} bytes"
            )));
        }
        let encoded = self.encoded_len();
        if encoded > MAX_RECORD_SIZE {
            return Err(Error::InvalidArgument(format!(
                "batch encodes to {encoded} bytes, at most {MAX_RECORD_SIZE} allowed"
            )));
        }
        Ok(())
    }

    /// Length of [`encode`](Self::encode)'s output.
    pub(crate) fn encoded_len(&self) -> usize {
        let framing: usize = self
            .ops
            .iter()
            .map(|op| if op.value().is_some() { 9 } else { 5 })
            .sum();
        12 + self.size + framing
    }

    /// Encodes the batch as a WAL payload:
    /// `base_seq: u64 | count: u32 | (kind: u8 | klen: u32 | key | [vlen: u32 | value])*`
    pub(crate) fn encode(&self, base_seq: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.write_u64::<BigEndian>(base_seq).unwrap();
        buf.write_u32::<BigEndian>(self.ops.len() as u32).unwrap();
        for op in &self.ops {
            buf.push(op.kind() as u8);
            buf.write_u32::<BigEndian>(op.key().len() as u32).unwrap();
            buf.extend_from_slice(op.key());
            if let Some(value) = op.value() {
                buf.write_u32::<BigEndian>(value.len() as u32).unwrap();
                buf.extend_from_slice(value);
            }
        }
        buf
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<(u64, WriteBatch)> {
        let mut cursor = Cursor::new(payload);
        let base_seq = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("batch sequence", e))?;
        let count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("batch count", e))?;

        let mut batch = WriteBatch::new();
        for _ in 0..count {
            let kind = cursor
                .read_u8()
                .map_err(|e| Error::Decode("batch op kind", e))?;
            let key = read_bytes(&mut cursor, "batch key")?;
            match ValueKind::from_u8(kind)? {
                ValueKind::Put => {
                    let value = read_bytes(&mut cursor, "batch value")?;
                    batch.put(key, value);
                }
                ValueKind::Delete => {
                    batch.delete(key);
                }
            }
        }

        if cursor.position() as usize != payload.len() {
            return Err(Error::Corruption("trailing bytes after write batch".into()));
        }
        Ok((base_seq, batch))
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<Vec<u8>> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Decode(what, e))? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(Error::Corruption(format!(
            "{what} length {len} exceeds remaining {remaining} bytes"
        )));
    }
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| Error::Decode(what, e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_encoding() {
        let mut batch = WriteBatch::new();
        batch.delete(b"key1".to_vec()).put(b"key2".to_vec(), b"value2".to_vec());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.approximate_size(), 14);

        let payload = batch.encode(17);
        assert_eq!(payload.len(), batch.encoded_len());
        let (base_seq, decoded) = WriteBatch::decode(&payload).unwrap();
        assert_eq!(base_seq, 17);
        assert_eq!(decoded, batch);
        assert_eq!(decoded.ops()[0].kind(), ValueKind::Delete);
        assert_eq!(decoded.ops()[1].value(), Some(&b"value2"[..]));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let mut batch = WriteBatch::new();
        batch.put(b"key".to_vec(), b"value".to_vec());
        let payload = batch.encode(1);

        assert!(WriteBatch::decode(&payload[..payload.len() - 1]).is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        let mut batch = WriteBatch::new();
        batch.put(b"".to_vec(), b"value".to_vec());
        assert!(matches!(batch.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let mut batch = WriteBatch::new();
        batch.put(b"big".to_vec(), vec![0u8; MAX_RECORD_SIZE]);
        assert!(batch.encoded_len() > MAX_RECORD_SIZE);
        assert!(matches!(batch.validate(), Err(Error::InvalidArgument(_))));

        let mut batch = WriteBatch::new();
        batch.put(b"fits".to_vec(), vec![0u8; MAX_RECORD_SIZE - 64]);
        assert!(batch.validate().is_ok());
    }
}

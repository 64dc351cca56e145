use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

/// Durable description of one SSTable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: u64,
    pub level: u32,
    pub size: u64,
    pub entry_count: u64,
    /// Smallest and largest user keys stored in the table.
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub min_seq: u64,
    pub max_seq: u64,
    /// CRC-64 of the whole file.
    pub checksum: u64,
}

impl TableMeta {
    /// Whether the table's key range intersects `[start, end]`.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.min_key.as_slice() <= end && self.max_key.as_slice() >= start
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.min_key.as_slice() <= key && key <= self.max_key.as_slice()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.id).unwrap();
        buf.write_u32::<BigEndian>(self.level).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_u64::<BigEndian>(self.entry_count).unwrap();

        buf.write_u32::<BigEndian>(self.min_key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.min_key);

        buf.write_u32::<BigEndian>(self.max_key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.max_key);

        buf.write_u64::<BigEndian>(self.min_seq).unwrap();
        buf.write_u64::<BigEndian>(self.max_seq).unwrap();
        buf.write_u64::<BigEndian>(self.checksum).unwrap();
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let id = read_u64(cursor, "table id")?;
        let level = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("table level", e))?;
        let size = read_u64(cursor, "table size")?;
        let entry_count = read_u64(cursor, "table entry count")?;
        let min_key = read_key(cursor, "table min key")?;
        let max_key = read_key(cursor, "table max key")?;
        let min_seq = read_u64(cursor, "table min seq")?;
        let max_seq = read_u64(cursor, "table max seq")?;
        let checksum = read_u64(cursor, "table checksum")?;

        Ok(TableMeta {
            id,
            level,
            size,
            entry_count,
            min_key,
            max_key,
            min_seq,
            max_seq,
            checksum,
        })
    }
}

fn read_u64(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<u64> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|e| Error::Decode(what, e))
}

fn read_key(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<Vec<u8>> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Decode(what, e))? as usize;
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(Error::Corruption(format!("{what} longer than record")));
    }
    let mut key = vec![0u8; len];
    cursor
        .read_exact(&mut key)
        .map_err(|e| Error::Decode(what, e))?;
    Ok(key)
}

/// The tables of one level, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelMeta {
    pub level: u32,
    pub tables: Vec<TableMeta>,
}

impl LevelMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.level).unwrap();
        buf.write_u32::<BigEndian>(self.tables.len() as u32)
            .unwrap();
        for table in &self.tables {
            table.encode_into(buf);
        }
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let level = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("level number", e))?;
        let table_count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("level table count", e))? as usize;
        let mut tables = Vec::with_capacity(table_count.min(1024));
        for _ in 0..table_count {
            tables.push(TableMeta::decode_from(cursor)?);
        }
        Ok(LevelMeta { level, tables })
    }
}

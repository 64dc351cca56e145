use super::super::batch::WriteBatch;
use super::super::wal::Wal;
use super::{core::Memtable, frozen::FrozenMemtable};
use crate::error::Result;
use std::sync::Arc;

/// The memtable currently accepting writes, paired with its WAL segment.
#[derive(Debug, Clone)]
pub struct ActiveMemtable {
    memtable: Arc<Memtable>,
    wal: Arc<Wal>,
}

impl ActiveMemtable {
    pub fn new(memtable: Memtable, wal: Wal) -> Self {
        Self {
            memtable: Arc::new(memtable),
            wal: Arc::new(wal),
        }
    }

    /// Logs the batch, then makes it readable in the memtable.
    pub fn write(&self, base_seq: u64, batch: &WriteBatch, sync: bool) -> Result<()> {
        self.wal.append(base_seq, batch, sync)?;
        self.memtable.apply(base_seq, batch)
    }

    pub fn get(&self, key: &[u8], seq: u64) -> Option<Option<Vec<u8>>> {
        self.memtable.get(key, seq)
    }

    pub fn size(&self) -> usize {
        self.memtable.size()
    }

    pub fn id(&self) -> u64 {
        self.memtable.id()
    }

    /// Freezes the memtable and retires its WAL segment.
    pub fn freeze(&self) -> Result<FrozenMemtable> {
        self.memtable.freeze()?;
        self.wal.rotate()?;
        Ok(FrozenMemtable {
            memtable: self.memtable.clone(),
            wal: self.wal.clone(),
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.wal.sync()
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }
}

use super::super::wal::Wal;
use super::core::Memtable;
use std::sync::Arc;

/// A read-only memtable waiting to be flushed. Its WAL segment stays on disk
/// until the flushed table is recorded in the manifest.
#[derive(Debug, Clone)]
pub struct FrozenMemtable {
    pub(super) memtable: Arc<Memtable>,
    pub(super) wal: Arc<Wal>,
}

impl FrozenMemtable {
    /// Wraps a memtable rebuilt from a WAL segment during recovery.
    pub fn recovered(memtable: Memtable, wal: Wal) -> crate::error::Result<Self> {
        memtable.freeze()?;
        wal.rotate()?;
        Ok(Self {
            memtable: Arc::new(memtable),
            wal: Arc::new(wal),
        })
    }

    pub fn id(&self) -> u64 {
        self.memtable.id()
    }

    pub fn get(&self, key: &[u8], seq: u64) -> Option<Option<Vec<u8>>> {
        self.memtable.get(key, seq)
    }

    pub fn size(&self) -> usize {
        self.memtable.size()
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }
}

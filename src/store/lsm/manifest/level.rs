use std::sync::Arc;

use super::super::sstable::Table;
use super::meta::TableMeta;

/// An open table together with the manifest record describing it.
#[derive(Debug)]
pub struct SSTable {
    pub meta: TableMeta,
    pub table: Arc<Table>,
}

impl SSTable {
    /// The manifest record is the source of truth for key range and size.
    pub fn new(table: Table, meta: TableMeta) -> Self {
        Self {
            meta,
            table: Arc::new(table),
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }
}

/// Tables of one level. Level 0 is ordered oldest first and may overlap;
/// deeper levels are sorted by `min_key` and disjoint.
#[derive(Debug, Clone)]
pub struct Level {
    pub level_num: u32,
    pub sstables: Vec<Arc<SSTable>>,
}

impl Level {
    pub fn new(level_num: u32) -> Self {
        Self {
            level_num,
            sstables: Vec::new(),
        }
    }

    /// Total bytes of all tables in the level.
    pub fn size(&self) -> u64 {
        self.sstables.iter().map(|sstable| sstable.size()).sum()
    }

    pub fn len(&self) -> usize {
        self.sstables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sstables.is_empty()
    }

    pub fn add_sstable(&mut self, sstable: Arc<SSTable>) {
        if self.level_num == 0 {
            self.sstables.push(sstable);
        } else {
            let pos = self
                .sstables
                .partition_point(|t| t.meta.min_key < sstable.meta.min_key);
            self.sstables.insert(pos, sstable);
        }
    }

    pub fn remove_sstables(&mut self, ids: &[u64]) {
        self.sstables.retain(|t| !ids.contains(&t.id()));
    }

    /// Tables whose key range intersects `[start, end]`.
    pub fn overlapping(&self, start: &[u8], end: &[u8]) -> Vec<Arc<SSTable>> {
        self.sstables
            .iter()
            .filter(|t| t.meta.overlaps(start, end))
            .cloned()
            .collect()
    }

    /// The single table that may hold `key` in a sorted level.
    pub fn find_table(&self, key: &[u8]) -> Option<&Arc<SSTable>> {
        debug_assert!(self.level_num > 0);
        let pos = self
            .sstables
            .partition_point(|t| t.meta.max_key.as_slice() < key);
        self.sstables
            .get(pos)
            .filter(|t| t.meta.min_key.as_slice() <= key)
    }

    /// Smallest and largest user keys across the level.
    pub fn key_range(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let min = self.sstables.iter().map(|t| &t.meta.min_key).min()?;
        let max = self.sstables.iter().map(|t| &t.meta.max_key).max()?;
        Some((min.clone(), max.clone()))
    }

    pub fn metas(&self) -> Vec<TableMeta> {
        self.sstables.iter().map(|t| t.meta.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lsm::key::InternalKey;
    use crate::store::lsm::sstable::TableBuilder;

    fn sstable(dir: &tempfile::TempDir, id: u64, level: u32, min: &str, max: &str) -> Arc<SSTable> {
        let path = dir.path().join(format!("{id:06}.sst"));
        let mut builder = TableBuilder::create(&path, id, level, 4096, 10).unwrap();
        builder
            .add(&InternalKey::new(min.as_bytes().to_vec(), id), Some(b"v"))
            .unwrap();
        if min != max {
            builder
                .add(&InternalKey::new(max.as_bytes().to_vec(), id), Some(b"v"))
                .unwrap();
        }
        let meta = builder.finish().unwrap();
        Arc::new(SSTable::new(Table::open(&path, id).unwrap(), meta))
    }

    #[test]
    fn test_sorted_level_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut level = Level::new(1);
        level.add_sstable(sstable(&dir, 2, 1, "m", "p"));
        level.add_sstable(sstable(&dir, 1, 1, "a", "c"));
        level.add_sstable(sstable(&dir, 3, 1, "x", "z"));

        let ids: Vec<u64> = level.sstables.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(level.find_table(b"b").map(|t| t.id()), Some(1));
        assert_eq!(level.find_table(b"p").map(|t| t.id()), Some(2));
        assert!(level.find_table(b"d").is_none());
        assert!(level.find_table(b"zz").is_none());

        let overlapping: Vec<u64> = level.overlapping(b"b", b"n").iter().map(|t| t.id()).collect();
        assert_eq!(overlapping, vec![1, 2]);
        assert_eq!(level.key_range(), Some((b"a".to_vec(), b"z".to_vec())));

        level.remove_sstables(&[2]);
        assert_eq!(level.len(), 2);
        assert_eq!(level.size(), level.sstables.iter().map(|t| t.meta.size).sum::<u64>());
    }

    #[test]
    fn test_level_zero_keeps_install_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut level = Level::new(0);
        level.add_sstable(sstable(&dir, 5, 0, "m", "z"));
        level.add_sstable(sstable(&dir, 6, 0, "a", "c"));

        let ids: Vec<u64> = level.sstables.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![5, 6]);
    }
}

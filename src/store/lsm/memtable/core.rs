//! Memtable implementation using a concurrent skip list.
//!
//! The memtable is the first stop of every write. It maps internal keys
//! (user key + sequence) to a value or a tombstone, so every version written
//! since the last flush is kept and reads can be served at any sequence.
//!
//! # Crossbeam SkipMap
//!
//! `crossbeam-skiplist::SkipMap` gives lock-free reads concurrent with the
//! single writer, ordered iteration for flushes and scans, and cheap
//! `lower_bound` seeks for point lookups.
//!
//! # Lifecycle
//!
//! 1. **Active**: accepts batches and grows until `write_buffer_size`
//! 2. **Frozen**: read-only, queued for flushing to disk
//! 3. **Flushed**: its table is installed in L0 and it is dropped
//!
//! Freezing happens exactly once, guarded by an `AtomicBool`.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use super::super::batch::{BatchOp, WriteBatch};
use super::super::iterator::Entry;
use super::super::key::{InternalKey, TRAILER_SIZE};
use crate::error::Result;
use crate::Error;

/// In-memory sorted table of versions, keyed by internal key.
#[derive(Debug)]
pub struct Memtable {
    id: u64,
    data: SkipMap<InternalKey, Option<Vec<u8>>>,
    size: AtomicUsize,
    first_seq: AtomicU64,
    last_seq: AtomicU64,
    frozen: AtomicBool,
}

impl Memtable {
    /// Creates an empty memtable. `id` matches the WAL segment backing it.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
            first_seq: AtomicU64::new(u64::MAX),
            last_seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Inserts every operation of `batch`, numbering them from `base_seq`.
    pub fn apply(&self, base_seq: u64, batch: &WriteBatch) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        for (offset, op) in batch.ops().iter().enumerate() {
            let seq = base_seq + offset as u64;
            let (key, value) = match op {
                BatchOp::Put { key, value } => (key.clone(), Some(value.clone())),
                BatchOp::Delete { key } => (key.clone(), None),
            };
            self.insert(InternalKey::new(key, seq), value);
        }
        Ok(())
    }

    fn insert(&self, key: InternalKey, value: Option<Vec<u8>>) {
        let entry_size = key.user_key.len() + TRAILER_SIZE + value.as_ref().map_or(0, |v| v.len());
        self.first_seq.fetch_min(key.seq, Ordering::SeqCst);
        self.last_seq.fetch_max(key.seq, Ordering::SeqCst);
        self.data.insert(key, value);
        self.size.fetch_add(entry_size, Ordering::SeqCst);
    }

    /// Newest version of `key` with sequence <= `seq`.
    ///
    /// `None` means the memtable holds no such version; `Some(None)` is a
    /// tombstone.
    pub fn get(&self, key: &[u8], seq: u64) -> Option<Option<Vec<u8>>> {
        let seek = InternalKey::seek(key, seq);
        let entry = self.data.lower_bound(Bound::Included(&seek))?;
        if entry.key().user_key.as_slice() != key {
            return None;
        }
        Some(entry.value().clone())
    }

    /// Approximate memory footprint: key + value + trailer bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Highest sequence stored, 0 when empty.
    pub fn last_sequence(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    pub fn first_sequence(&self) -> Option<u64> {
        match self.first_seq.load(Ordering::SeqCst) {
            u64::MAX => None,
            seq => Some(seq),
        }
    }

    /// Marks the memtable read-only. Fails if it already was.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Iterates every version whose user key is within `[start, end)`.
    pub fn iter(self: &Arc<Self>, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> MemtableIterator {
        let from = match start {
            Bound::Included(key) => Bound::Included(InternalKey::seek(&key, u64::MAX)),
            Bound::Excluded(key) => Bound::Excluded(InternalKey::seek(&key, 0)),
            Bound::Unbounded => Bound::Unbounded,
        };
        MemtableIterator {
            memtable: Arc::clone(self),
            from,
            end,
            exhausted: false,
        }
    }
}

/// Owned, lazily advancing iterator over a memtable.
///
/// Each step seeks past the last returned key, so the iterator holds no
/// borrow of the skip list and stays valid while writers keep inserting.
pub struct MemtableIterator {
    memtable: Arc<Memtable>,
    from: Bound<InternalKey>,
    end: Bound<Vec<u8>>,
    exhausted: bool,
}

impl MemtableIterator {
    fn past_end(&self, user_key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => user_key > end.as_slice(),
            Bound::Excluded(end) => user_key >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }
}

impl Iterator for MemtableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let entry = match &self.from {
            Bound::Included(key) => self.memtable.data.lower_bound(Bound::Included(key)),
            Bound::Excluded(key) => self.memtable.data.lower_bound(Bound::Excluded(key)),
            Bound::Unbounded => self.memtable.data.front(),
        };
        let Some(entry) = entry else {
            self.exhausted = true;
            return None;
        };
        if self.past_end(&entry.key().user_key) {
            self.exhausted = true;
            return None;
        }
        let key = entry.key().clone();
        let value = entry.value().clone();
        self.from = Bound::Excluded(key.clone());
        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memtable_with(ops: &[(u64, &str, Option<&str>)]) -> Arc<Memtable> {
        let memtable = Arc::new(Memtable::new(1));
        for (seq, key, value) in ops {
            let mut batch = WriteBatch::new();
            match value {
                Some(value) => batch.put(key.as_bytes(), value.as_bytes()),
                None => batch.delete(key.as_bytes()),
            };
            memtable.apply(*seq, &batch).unwrap();
        }
        memtable
    }

    #[test]
    fn test_get_respects_sequence() {
        let memtable = memtable_with(&[
            (1, "key1", Some("v1")),
            (2, "key1", Some("v2")),
            (3, "key1", None),
        ]);

        assert_eq!(memtable.get(b"key1", 1), Some(Some(b"v1".to_vec())));
        assert_eq!(memtable.get(b"key1", 2), Some(Some(b"v2".to_vec())));
        assert_eq!(memtable.get(b"key1", 3), Some(None));
        assert_eq!(memtable.get(b"key1", 0), None);
        assert_eq!(memtable.get(b"key0", 3), None);
        assert_eq!(memtable.get(b"key2", 3), None);
    }

    #[test]
    fn test_batch_gets_consecutive_sequences() {
        let memtable = Arc::new(Memtable::new(7));
        let mut batch = WriteBatch::new();
        batch.delete(b"key1".to_vec()).put(b"key2".to_vec(), b"value2".to_vec());
        memtable.apply(5, &batch).unwrap();

        assert_eq!(memtable.first_sequence(), Some(5));
        assert_eq!(memtable.last_sequence(), 6);
        assert_eq!(memtable.get(b"key1", 6), Some(None));
        assert_eq!(memtable.get(b"key2", 5), None);
        assert_eq!(memtable.get(b"key2", 6), Some(Some(b"value2".to_vec())));
        assert_eq!(memtable.size(), 4 + 8 + 4 + 6 + 8);
    }

    #[test]
    fn test_freeze_once() {
        let memtable = Memtable::new(1);
        memtable.freeze().unwrap();
        assert!(memtable.is_frozen());
        assert!(matches!(memtable.freeze(), Err(Error::ReadOnly)));

        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        assert!(matches!(memtable.apply(1, &batch), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_iter_range_includes_all_versions() {
        let memtable = memtable_with(&[
            (1, "a", Some("1")),
            (2, "b", Some("2")),
            (3, "b", Some("3")),
            (4, "c", Some("4")),
            (5, "d", Some("5")),
        ]);

        let entries: Vec<_> = memtable
            .iter(Bound::Included(b"b".to_vec()), Bound::Excluded(b"d".to_vec()))
            .map(|e| e.unwrap())
            .map(|(k, _)| (String::from_utf8(k.user_key).unwrap(), k.seq))
            .collect();

        assert_eq!(
            entries,
            vec![("b".into(), 3), ("b".into(), 2), ("c".into(), 4)]
        );
    }

    #[test]
    fn test_iter_sees_concurrent_inserts_after_cursor() {
        let memtable = memtable_with(&[(1, "a", Some("1"))]);
        let mut iter = memtable.iter(Bound::Unbounded, Bound::Unbounded);
        assert!(iter.next().is_some());

        let mut batch = WriteBatch::new();
        batch.put(b"b".to_vec(), b"2".to_vec());
        memtable.apply(2, &batch).unwrap();

        let (key, value) = iter.next().unwrap().unwrap();
        assert_eq!(key.user_key, b"b");
        assert_eq!(value, Some(b"2".to_vec()));
        assert!(iter.next().is_none());
    }
}

//! Iterators combining memtables and tables into one ordered view.
//!
//! [`MergeIterator`] k-way merges sources by internal key using a binary heap.
//! Sources are ranked newest first; when two sources yield the same internal
//! key the newer one wins. [`ScanIterator`] sits on top and turns versions
//! into the user-visible state at a read sequence.

use super::key::InternalKey;
use crate::error::Result;
use std::{cmp::Ordering, collections::BinaryHeap};

/// One version: internal key and value, `None` for a tombstone.
pub type Entry = (InternalKey, Option<Vec<u8>>);

/// Boxed source of versions in internal-key order.
pub type EntryIterator = Box<dyn Iterator<Item = Result<Entry>> + Send>;

struct HeapEntry {
    key: InternalKey,
    value: Option<Vec<u8>>,
    source: usize,
    iterator: EntryIterator,
}

impl std::fmt::Debug for HeapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("key", &self.key)
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the max-heap pops the smallest key, then the newest source.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges sorted sources into one sorted stream of versions.
#[derive(Debug)]
pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<InternalKey>,
    error: Option<crate::Error>,
}

impl MergeIterator {
    /// `iterators` are ordered newest source first.
    pub fn new(iterators: Vec<EntryIterator>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(iterators.len()),
            last_key: None,
            error: None,
        };
        for (source, iterator) in iterators.into_iter().enumerate() {
            merge.advance(source, iterator);
        }
        merge
    }

    fn advance(&mut self, source: usize, mut iterator: EntryIterator) {
        match iterator.next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source,
                iterator,
            }),
            Some(Err(e)) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.error.take() {
                self.heap.clear();
                return Some(Err(e));
            }
            let entry = self.heap.pop()?;
            let HeapEntry {
                key,
                value,
                source,
                iterator,
            } = entry;
            self.advance(source, iterator);

            if self.last_key.as_ref() == Some(&key) {
                continue;
            }
            self.last_key = Some(key.clone());
            return Some(Ok((key, value)));
        }
    }
}

/// User-visible pairs at a read sequence: for each key the newest version
/// with sequence <= `read_seq`, skipping keys whose newest version is a
/// tombstone.
pub struct ScanIterator {
    inner: MergeIterator,
    read_seq: u64,
    current_key: Option<Vec<u8>>,
    done: bool,
}

impl ScanIterator {
    pub fn new(inner: MergeIterator, read_seq: u64) -> Self {
        Self {
            inner,
            read_seq,
            current_key: None,
            done: false,
        }
    }
}

impl std::fmt::Debug for ScanIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanIterator")
            .field("read_seq", &self.read_seq)
            .finish()
    }
}

impl Iterator for ScanIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (key, value) = match self.inner.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return None;
                }
            };
            if key.seq > self.read_seq {
                continue;
            }
            if self.current_key.as_deref() == Some(key.user_key.as_slice()) {
                continue;
            }
            self.current_key = Some(key.user_key.clone());
            if let Some(value) = value {
                return Some(Ok((key.user_key, value)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn source(entries: Vec<(&str, u64, Option<&str>)>) -> EntryIterator {
        let items: Vec<Result<Entry>> = entries
            .into_iter()
            .map(|(k, seq, v)| {
                Ok((
                    InternalKey::new(k.as_bytes().to_vec(), seq),
                    v.map(|v| v.as_bytes().to_vec()),
                ))
            })
            .collect();
        Box::new(items.into_iter())
    }

    #[test]
    fn test_merge_orders_by_internal_key() {
        let merged: Vec<(String, u64)> = MergeIterator::new(vec![
            source(vec![("b", 7, Some("b7")), ("d", 8, None)]),
            source(vec![("a", 1, Some("a1")), ("b", 3, Some("b3"))]),
            source(vec![("c", 2, Some("c2"))]),
        ])
        .map(|r| r.unwrap())
        .map(|(k, _)| (String::from_utf8(k.user_key).unwrap(), k.seq))
        .collect();

        assert_eq!(
            merged,
            vec![
                ("a".into(), 1),
                ("b".into(), 7),
                ("b".into(), 3),
                ("c".into(), 2),
                ("d".into(), 8),
            ]
        );
    }

    #[test]
    fn test_merge_prefers_newest_source_on_duplicates() {
        let merged: Vec<Entry> = MergeIterator::new(vec![
            source(vec![("k", 5, Some("new"))]),
            source(vec![("k", 5, Some("old"))]),
        ])
        .collect::<Result<_>>()
        .unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1, Some(b"new".to_vec()));
    }

    #[test]
    fn test_scan_visibility() {
        let merge = || {
            MergeIterator::new(vec![
                source(vec![("a", 9, None), ("b", 6, Some("b6"))]),
                source(vec![("a", 4, Some("a4")), ("b", 2, Some("b2")), ("c", 3, Some("c3"))]),
            ])
        };

        let latest: Vec<(Vec<u8>, Vec<u8>)> =
            ScanIterator::new(merge(), 100).collect::<Result<_>>().unwrap();
        assert_eq!(
            latest,
            vec![
                (b"b".to_vec(), b"b6".to_vec()),
                (b"c".to_vec(), b"c3".to_vec()),
            ]
        );

        let at_5: Vec<(Vec<u8>, Vec<u8>)> =
            ScanIterator::new(merge(), 5).collect::<Result<_>>().unwrap();
        assert_eq!(
            at_5,
            vec![
                (b"a".to_vec(), b"a4".to_vec()),
                (b"b".to_vec(), b"b2".to_vec()),
                (b"c".to_vec(), b"c3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_source_error_surfaces() {
        let failing: EntryIterator = Box::new(
            vec![Err(Error::Corruption("bad block".into()))].into_iter(),
        );
        let mut merge = MergeIterator::new(vec![source(vec![("a", 1, Some("x"))]), failing]);
        assert!(matches!(merge.next(), Some(Err(Error::Corruption(_)))));
        assert!(merge.next().is_none());
    }
}

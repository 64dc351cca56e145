use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Sequence numbers pinned by live snapshots, with reference counts.
#[derive(Debug, Default)]
pub struct SnapshotList {
    seqs: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, seq: u64) -> Snapshot {
        self.acquire_with(|| seq)
    }

    /// Pins the sequence returned by `seq`, read while the list is locked so
    /// that a concurrent [`oldest_or`](Self::oldest_or) never misses it.
    pub fn acquire_with(self: &Arc<Self>, seq: impl FnOnce() -> u64) -> Snapshot {
        let seq = match self.seqs.lock() {
            Ok(mut seqs) => {
                let seq = seq();
                *seqs.entry(seq).or_insert(0) += 1;
                seq
            }
            Err(_) => seq(),
        };
        Snapshot {
            seq,
            list: Arc::clone(self),
        }
    }

    fn release(&self, seq: u64) {
        let Ok(mut seqs) = self.seqs.lock() else {
            return;
        };
        if let Some(count) = seqs.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                seqs.remove(&seq);
            }
        }
    }

    /// Oldest pinned sequence, if any snapshot is alive.
    pub fn oldest(&self) -> Option<u64> {
        self.seqs.lock().ok()?.keys().next().copied()
    }

    /// Oldest pinned sequence, or `fallback()` when no snapshot is alive.
    pub fn oldest_or(&self, fallback: impl FnOnce() -> u64) -> u64 {
        match self.seqs.lock() {
            Ok(seqs) => seqs.keys().next().copied().unwrap_or_else(fallback),
            Err(_) => fallback(),
        }
    }

    pub fn len(&self) -> usize {
        self.seqs
            .lock()
            .map(|seqs| seqs.values().sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A consistent read point. Compaction keeps every version this snapshot can
/// see until it is dropped.
#[derive(Debug)]
pub struct Snapshot {
    seq: u64,
    list: Arc<SnapshotList>,
}

impl Snapshot {
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.release(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_tracks_live_snapshots() {
        let list = Arc::new(SnapshotList::new());
        assert_eq!(list.oldest(), None);

        let s5 = list.acquire(5);
        let s9 = list.acquire(9);
        let s5_again = list.acquire(5);
        assert_eq!(list.oldest(), Some(5));
        assert_eq!(list.len(), 3);

        drop(s5);
        assert_eq!(list.oldest(), Some(5));
        drop(s5_again);
        assert_eq!(list.oldest(), Some(9));
        assert_eq!(s9.sequence(), 9);
        drop(s9);
        assert!(list.is_empty());
    }
}

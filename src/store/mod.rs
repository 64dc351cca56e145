pub mod lsm;

use std::ops::{Bound, RangeBounds};

use crate::error::Result;
use lsm::WriteBatch;

/// Key-value operations with default read and write options. Implemented by
/// [`lsm::Engine`]; callers needing snapshots or synced writes use the
/// engine's own methods.
pub trait Store: Send + Sync {
    /// The iterator returned by scan().
    type ScanIterator<'a>: ScanIterator + 'a
    where
        Self: Sized + 'a; // omit in trait objects, for dyn compatibility

    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Writes a tombstone; deleting an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Applies every operation of `batch` or none of them.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Visible pairs within `range`, in key order.
    fn scan<'a>(
        &'a self,
        range: impl RangeBounds<Vec<u8>> + Clone + Send + Sync + 'a,
    ) -> Self::ScanIterator<'a>
    where
        Self: Sized; // omit in trait objects, for dyn compatibility

    /// Visible pairs whose key starts with `prefix`.
    fn scan_prefix<'a>(&'a self, prefix: &'a [u8]) -> Self::ScanIterator<'a>
    where
        Self: Sized,
    {
        let end = prefix_successor(prefix).map_or(Bound::Unbounded, Bound::Excluded);
        self.scan((Bound::Included(prefix.to_vec()), end))
    }

    /// Flushes and fsyncs the active WAL segment.
    fn sync(&self) -> Result<()>;
}

/// The smallest key greater than every key starting with `prefix`, or `None`
/// when the prefix is all `0xff`.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let last = prefix.iter().rposition(|b| *b != 0xff)?;
    let mut end = prefix[..=last].to_vec();
    end[last] += 1;
    Some(end)
}

pub trait ScanIterator: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {}

impl<I> ScanIterator for I where I: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {}

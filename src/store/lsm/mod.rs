//! LSM-Tree storage engine implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐
//! │ Active Memtable │───►│ Frozen Memtables │
//! │   (SkipList)    │    │   (SkipLists)    │
//! └─────────────────┘    └──────────────────┘
//!          │                      │ flush (age order)
//!          ▼                      ▼
//!    ┌───────────┐          ┌───────────┐
//!    │WAL segment│          │  Level 0  │  overlapping, oldest first
//!    └───────────┘          └───────────┘
//!                                 │ compaction
//!                                 ▼
//!                           ┌───────────┐
//!                           │ Level 1-6 │  sorted, disjoint
//!                           └───────────┘
//! ```
//!
//! # Write Path
//! 1. **Backpressure**: writers wait while too many memtables or L0 tables pile up
//! 2. **Sequence**: the batch gets a contiguous range of sequence numbers
//! 3. **WAL Write**: the batch is appended as one record
//! 4. **Memtable Insert**: every operation becomes an internal key in the skiplist
//! 5. **Publish**: the last sequence of the batch becomes visible to readers
//! 6. **Freeze**: a full memtable is swapped for a new one with a new WAL segment
//!
//! # Read Path
//! A read fixes its sequence number, clones the current memtables and
//! [`Version`](state::Version) under one short lock, then searches the active
//! memtable, frozen memtables newest first, L0 newest first and one table per
//! deeper level.
//!
//! # Files
//! - `LOCK`: exclusive lock held by the open engine
//! - `MANIFEST`: log of [`VersionEdit`](manifest::VersionEdit)s
//! - `wal/<id>.wal`: one segment per memtable
//! - `sst/<id>.sst`: tables

pub mod batch;
pub mod compaction;
pub mod files;
pub mod flush;
pub mod iterator;
pub mod key;
pub mod manifest;
pub mod memtable;
pub mod metrics;
pub mod recovery;
pub mod snapshot;
pub mod sstable;
pub mod state;
pub mod store;
pub mod tasks;
pub mod wal;

pub use batch::WriteBatch;
pub use files::{LiveFiles, LiveWal};
pub use iterator::ScanIterator;
pub use manifest::{LevelMeta, TableMeta};
pub use metrics::{LevelStats, Stats};
pub use snapshot::Snapshot;
pub use state::{LsmState, NUM_LEVELS};
pub use store::Engine;

//! Sorted String Tables (SSTables), the immutable on-disk runs of the tree.
//!
//! # Components
//!
//! ## Data Blocks (`block.rs`)
//!
//! Blocks of about `block_size` bytes holding encoded internal keys:
//! - **Prefix compression**: keys share common prefixes to reduce storage
//! - **Restart points**: every 16 entries a full key is stored for seeking
//! - **Checksums**: each block is followed by its CRC-32
//!
//! ### Block Entry Format
//! ```text
//! +----------------+----------------+-------------+--------+-------+
//! |shared_len:u16  |unshared_len:u16|value_len:u32| key    | value |
//! +----------------+----------------+-------------+--------+-------+
//! ```
//!
//! ## Index (`index.rs`)
//!
//! Maps the last internal key of every block to its handle. Binary search
//! over last keys finds the single block that can hold a target key.
//!
//! ## Bloom Filter (`filter.rs`)
//!
//! One filter per table over distinct user keys, so point lookups skip
//! tables that cannot hold the key.
//!
//! ## Tables (`table.rs`)
//!
//! `TableBuilder` streams sorted entries to disk and returns the table's
//! manifest metadata, CRC-64 fingerprint included. `Table` serves point
//! lookups and owned range iterators.

mod index;

pub mod block;
pub mod filter;
pub mod table;

pub use table::{Table, TableBuilder, TableIterator};

pub mod active;
pub mod core;
pub mod frozen;

pub use active::ActiveMemtable;
pub use core::{Memtable, MemtableIterator};
pub use frozen::FrozenMemtable;

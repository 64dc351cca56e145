//! An embedded, log-structured key-value store with online backups.
//!
//! ```no_run
//! use cinderdb::{BackupEngine, BackupOptions, Engine, Options, ReadOptions, WriteOptions};
//!
//! # fn main() -> cinderdb::Result<()> {
//! let engine = Engine::open(Options::new("/tmp/cinderdb"))?;
//! engine.put(&WriteOptions::default(), "key", "value")?;
//! assert_eq!(engine.get(&ReadOptions::default(), b"key")?, Some(b"value".to_vec()));
//!
//! let backups = BackupEngine::open(BackupOptions::new("/tmp/cinderdb-backups"))?;
//! let id = backups.create_new_backup(&engine)?;
//! backups.verify_backup(id)?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod config;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod scheduler;
pub mod store;

pub use backup::{BackupEngine, BackupId, BackupInfo, CancelHandle};
pub use config::{
    BackupOptions, CompactionOptions, CompactionStrategy, Options, ReadOptions, WriteOptions,
};
pub use error::{Error, ErrorKind, Result};
pub use hasher::Hasher;
pub use store::lsm::{Engine, LiveFiles, Snapshot, Stats, WriteBatch};
pub use store::Store;

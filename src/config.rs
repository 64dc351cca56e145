use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the LSM engine
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Create the database directory if it does not exist (default: true)
    pub create_if_missing: bool,

    /// Refuse to open an existing database (default: false)
    pub error_if_exists: bool,

    /// Number of background worker threads (default: 2)
    pub parallelism: usize,

    /// Size at which the active memtable is frozen (default: 64MB)
    pub write_buffer_size: usize,

    /// Maximum number of memtables (active + frozen) before writes stall (default: 2)
    pub max_write_buffer_number: usize,

    /// Target size of SSTables produced by compaction (default: 64MB)
    pub target_file_size: u64,

    /// Maximum number of concurrent compaction jobs (default: 1)
    pub max_background_compactions: usize,

    /// Maximum number of concurrent flush jobs (default: 1)
    pub max_background_flushes: usize,

    /// Target size of an SSTable data block (default: 4KB)
    pub block_size: usize,

    /// Bloom filter bits per key, 0 disables filters (default: 10)
    pub bloom_bits_per_key: usize,

    /// WAL buffer size (default: 64KB)
    pub wal_buffer_size: usize,

    /// How many times a failed flush is retried before the engine stops accepting writes (default: 3)
    pub max_background_retries: u32,

    /// How long a stalled writer waits before giving up with `Busy` (default: 10s)
    pub write_stall_timeout: Duration,

    /// How often to check for flush opportunities (default: 1s)
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 5s)
    pub compaction_interval: Duration,

    /// How often to log engine metrics (default: 60s)
    pub metrics_interval: Duration,

    /// Compaction configuration
    pub compaction: CompactionOptions,
}

/// Closed set of compaction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    /// Per-level byte budgets growing by `level_size_multiplier`; one table at a time.
    Leveled,
    /// Whole levels merged into the next once they accumulate enough tables.
    Tiered,
    /// No automatic compaction. Used for bulk loading followed by `compact_all`.
    None,
}

#[derive(Debug, Clone)]
pub struct CompactionOptions {
    pub strategy: CompactionStrategy,

    /// Level 0 table count that triggers compaction (default: 4)
    pub level0_file_num_compaction_trigger: usize,

    /// Level 0 table count at which writes stall (default: 36)
    pub level0_stop_writes_trigger: usize,

    /// Byte budget of level 1 for leveled compaction (default: 256MB)
    pub max_bytes_for_level_base: u64,

    /// Growth factor between consecutive level budgets (default: 10)
    pub level_size_multiplier: u64,

    /// Size ratio threshold for tiered compaction (default: 10)
    /// When the combined size of tables at level N is >= size_ratio * size of level N+1,
    /// compact level N into level N+1
    pub size_ratio_threshold: u32,

    /// Table count that makes a level eligible for tiered compaction (default: 10)
    pub max_tables_per_level: usize,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            strategy: CompactionStrategy::Leveled,
            level0_file_num_compaction_trigger: 4,
            level0_stop_writes_trigger: 36,
            max_bytes_for_level_base: 256 * 1024 * 1024,
            level_size_multiplier: 10,
            size_ratio_threshold: 10,
            max_tables_per_level: 10,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            create_if_missing: true,
            error_if_exists: false,
            parallelism: 2,
            write_buffer_size: 64 * 1024 * 1024,
            max_write_buffer_number: 2,
            target_file_size: 64 * 1024 * 1024,
            max_background_compactions: 1,
            max_background_flushes: 1,
            block_size: 4096,
            bloom_bits_per_key: 10,
            wal_buffer_size: 64 * 1024,
            max_background_retries: 3,
            write_stall_timeout: Duration::from_secs(10),
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(60),
            compaction: CompactionOptions::default(),
        }
    }
}

impl Options {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn create_if_missing(mut self, enabled: bool) -> Self {
        self.create_if_missing = enabled;
        self
    }

    pub fn error_if_exists(mut self, enabled: bool) -> Self {
        self.error_if_exists = enabled;
        self
    }

    pub fn parallelism(mut self, threads: usize) -> Self {
        self.parallelism = threads;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn max_write_buffer_number(mut self, count: usize) -> Self {
        self.max_write_buffer_number = count;
        self
    }

    pub fn target_file_size(mut self, size: u64) -> Self {
        self.target_file_size = size;
        self
    }

    pub fn max_background_compactions(mut self, count: usize) -> Self {
        self.max_background_compactions = count;
        self
    }

    pub fn max_background_flushes(mut self, count: usize) -> Self {
        self.max_background_flushes = count;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn bloom_bits_per_key(mut self, bits: usize) -> Self {
        self.bloom_bits_per_key = bits;
        self
    }

    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    pub fn max_background_retries(mut self, retries: u32) -> Self {
        self.max_background_retries = retries;
        self
    }

    pub fn write_stall_timeout(mut self, timeout: Duration) -> Self {
        self.write_stall_timeout = timeout;
        self
    }

    /// Set flush check interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set compaction check interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionOptions) -> Self {
        self.compaction = config;
        self
    }

    /// Use `threads` background workers and let flushes and compactions share them.
    pub fn increase_parallelism(mut self, threads: usize) -> Self {
        let threads = threads.max(1);
        self.parallelism = threads;
        self.max_background_compactions = threads.saturating_sub(1).max(1);
        self.max_background_flushes = 1;
        self
    }

    /// Size memtables and level budgets for leveled compaction out of a memory budget.
    pub fn optimize_level_style_compaction(mut self, memtable_memory_budget: usize) -> Self {
        self.write_buffer_size = (memtable_memory_budget / 4).max(1);
        self.max_write_buffer_number = 6;
        self.target_file_size = (memtable_memory_budget / 8).max(1) as u64;
        self.compaction.strategy = CompactionStrategy::Leveled;
        self.compaction.level0_file_num_compaction_trigger = 2;
        self.compaction.max_bytes_for_level_base = memtable_memory_budget as u64;
        self
    }

    /// Disable automatic compaction and write stalls so that data can be ingested
    /// as fast as possible. Follow the load with `Engine::compact_all`.
    pub fn prepare_for_bulk_load(mut self) -> Self {
        self.compaction.strategy = CompactionStrategy::None;
        self.compaction.level0_file_num_compaction_trigger = 1 << 30;
        self.compaction.level0_stop_writes_trigger = 1 << 30;
        self.max_write_buffer_number = self.max_write_buffer_number.max(4);
        self.max_background_flushes = self.max_background_flushes.max(4);
        self.target_file_size = self.target_file_size.max(256 * 1024 * 1024);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::InvalidArgument("parallelism must be > 0".into()));
        }
        if self.write_buffer_size == 0 {
            return Err(Error::InvalidArgument("write_buffer_size must be > 0".into()));
        }
        if self.max_write_buffer_number < 2 {
            return Err(Error::InvalidArgument(
                "max_write_buffer_number must be >= 2".into(),
            ));
        }
        if self.target_file_size == 0 || self.block_size == 0 {
            return Err(Error::InvalidArgument(
                "target_file_size and block_size must be > 0".into(),
            ));
        }
        if self.max_background_compactions == 0 || self.max_background_flushes == 0 {
            return Err(Error::InvalidArgument(
                "background job limits must be > 0".into(),
            ));
        }
        if self.compaction.level_size_multiplier < 2 {
            return Err(Error::InvalidArgument(
                "level_size_multiplier must be >= 2".into(),
            ));
        }
        if self.compaction.level0_stop_writes_trigger
            < self.compaction.level0_file_num_compaction_trigger
        {
            return Err(Error::InvalidArgument(
                "level0_stop_writes_trigger must be >= level0_file_num_compaction_trigger".into(),
            ));
        }
        Ok(())
    }
}

impl CompactionOptions {
    pub fn strategy(mut self, strategy: CompactionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set level 0 compaction threshold
    pub fn level0_file_num_compaction_trigger(mut self, threshold: usize) -> Self {
        self.level0_file_num_compaction_trigger = threshold;
        self
    }

    pub fn level0_stop_writes_trigger(mut self, threshold: usize) -> Self {
        self.level0_stop_writes_trigger = threshold;
        self
    }

    pub fn max_bytes_for_level_base(mut self, bytes: u64) -> Self {
        self.max_bytes_for_level_base = bytes;
        self
    }

    pub fn level_size_multiplier(mut self, multiplier: u64) -> Self {
        self.level_size_multiplier = multiplier;
        self
    }

    /// Set size ratio threshold for tiered compaction
    pub fn size_ratio_threshold(mut self, ratio: u32) -> Self {
        self.size_ratio_threshold = ratio;
        self
    }

    /// Set maximum tables per level for tiered compaction
    pub fn max_tables_per_level(mut self, max_tables: usize) -> Self {
        self.max_tables_per_level = max_tables;
        self
    }

    /// Byte budget for `level` (>= 1) under leveled compaction.
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut budget = self.max_bytes_for_level_base;
        for _ in 1..level {
            budget = budget.saturating_mul(self.level_size_multiplier);
        }
        budget
    }
}

/// Durability of a single write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// fsync the WAL before the write returns
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync() -> Self {
        Self { sync: true }
    }
}

/// Read options. Reads observe the latest committed state unless pinned to a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub snapshot: Option<u64>,
}

impl ReadOptions {
    pub fn at(sequence: u64) -> Self {
        Self {
            snapshot: Some(sequence),
        }
    }
}

/// Backup engine configuration.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Root of the backup directory (`meta/`, `shared/`, `private/`)
    pub backup_dir: PathBuf,
    /// Flush memtables before capturing files, so backups hold mostly tables (default: true)
    pub flush_before_backup: bool,
    /// fsync every copied file and metadata write (default: true)
    pub sync: bool,
}

impl BackupOptions {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            flush_before_backup: true,
            sync: true,
        }
    }

    pub fn flush_before_backup(mut self, enabled: bool) -> Self {
        self.flush_before_backup = enabled;
        self
    }

    pub fn sync(mut self, enabled: bool) -> Self {
        self.sync = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("backup_dir must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Options::default();
        assert_eq!(config.dir, PathBuf::from("./cinderdb"));
        assert_eq!(config.write_buffer_size, 64 * 1024 * 1024);
        assert!(config.create_if_missing);
        assert_eq!(config.wal_buffer_size, 64 * 1024);

        assert_eq!(config.compaction.strategy, CompactionStrategy::Leveled);
        assert_eq!(config.compaction.level0_file_num_compaction_trigger, 4);
        assert_eq!(config.compaction.size_ratio_threshold, 10);
        assert_eq!(config.compaction.max_tables_per_level, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = Options::new("/tmp/test")
            .write_buffer_size(32 * 1024 * 1024)
            .flush_interval(Duration::from_millis(500))
            .compaction_interval(Duration::from_secs(5))
            .compaction(
                CompactionOptions::default()
                    .strategy(CompactionStrategy::Tiered)
                    .level0_file_num_compaction_trigger(2)
                    .size_ratio_threshold(5)
                    .max_tables_per_level(8),
            );

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.write_buffer_size, 32 * 1024 * 1024);
        assert_eq!(config.flush_interval, Duration::from_millis(500));
        assert_eq!(config.compaction_interval, Duration::from_secs(5));

        assert_eq!(config.compaction.strategy, CompactionStrategy::Tiered);
        assert_eq!(config.compaction.level0_file_num_compaction_trigger, 2);
        assert_eq!(config.compaction.size_ratio_threshold, 5);
        assert_eq!(config.compaction.max_tables_per_level, 8);
    }

    #[test]
    fn test_bulk_load_preset() {
        let config = Options::new("/tmp/bulk")
            .increase_parallelism(16)
            .prepare_for_bulk_load()
            .write_buffer_size(256 * 1024 * 1024)
            .target_file_size(512 * 1024 * 1024)
            .max_background_compactions(16)
            .max_background_flushes(16)
            .max_write_buffer_number(16);

        assert_eq!(config.parallelism, 16);
        assert_eq!(config.compaction.strategy, CompactionStrategy::None);
        assert_eq!(config.max_background_flushes, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let config = Options::new("/tmp/bad").parallelism(0);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let config = Options::new("/tmp/bad").max_write_buffer_number(1);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_backup_options() {
        let options = BackupOptions::new("/tmp/backups").flush_before_backup(false);
        assert!(!options.flush_before_backup);
        assert!(options.sync);
        assert!(options.validate().is_ok());
        assert!(BackupOptions::new("").validate().is_err());
    }

    #[test]
    fn test_level_budgets() {
        let options = CompactionOptions::default()
            .max_bytes_for_level_base(100)
            .level_size_multiplier(10);
        assert_eq!(options.max_bytes_for_level(1), 100);
        assert_eq!(options.max_bytes_for_level(2), 1000);
        assert_eq!(options.max_bytes_for_level(3), 10000);
    }
}

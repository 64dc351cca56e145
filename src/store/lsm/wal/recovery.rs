use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::Wal;
use crate::error::Result;
use crate::store::lsm::batch::WriteBatch;

/// Intact contents of one WAL segment after crash recovery.
#[derive(Debug)]
pub struct RecoveredSegment {
    pub id: u64,
    pub path: PathBuf,
    pub batches: Vec<(u64, WriteBatch)>,
    /// Length of the segment after the torn tail (if any) was cut off.
    pub valid_len: u64,
}

impl RecoveredSegment {
    pub fn last_sequence(&self) -> Option<u64> {
        self.batches
            .last()
            .map(|(base, batch)| base + batch.len() as u64 - 1)
    }
}

/// Reads every intact record of the segment and truncates the file after
/// the last one. Replaying the same segment twice yields the same batches.
pub fn recover_segment(path: &Path, id: u64) -> Result<RecoveredSegment> {
    let mut replay = Wal::replay(path)?;
    let batches = replay.by_ref().collect::<Result<Vec<_>>>()?;
    let valid_len = replay.valid_len();

    if let Some(reason) = replay.torn_tail() {
        warn!(
            wal_id = id,
            path = %path.display(),
            file_len = replay.file_len(),
            valid_len,
            ?reason,
            "Truncating torn WAL tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len)?;
        file.sync_all()?;
    }

    Ok(RecoveredSegment {
        id,
        path: path.to_path_buf(),
        batches,
        valid_len,
    })
}

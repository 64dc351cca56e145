use std::fs;
use std::path::Path;

use tracing::info;

use super::copy::copy_file;
use super::meta::{BackupMeta, FileKind};
use crate::error::Result;
use crate::flock::FileLock;
use crate::store::lsm::files::{self, LOCK_FILE, MANIFEST_FILE};
use crate::store::lsm::manifest::{Manifest, ManifestState};
use crate::Error;

/// Rebuilds a database directory from a verified generation.
pub(super) fn restore(root: &Path, meta: &BackupMeta, target: &Path, sync: bool) -> Result<()> {
    check_target(target)?;
    fs::create_dir_all(files::sst_dir(target))?;
    fs::create_dir_all(files::wal_dir(target))?;

    for file in &meta.files {
        let src = root.join(&file.path);
        let dst = match file.kind {
            FileKind::Table => files::sst_path(target, file.id),
            FileKind::Wal => files::wal_path(target, file.id),
        };
        copy_file(&src, &dst, None, sync)?;
    }

    let state = ManifestState {
        levels: meta.levels.clone(),
        next_table_id: meta.next_table_id,
        last_sequence: meta.last_sequence,
        wal_id: meta.flushed_wal_id,
        last_edit_seq: 0,
    };
    Manifest::write_snapshot(&target.join(MANIFEST_FILE), &state)?;

    info!(
        backup_id = meta.id,
        target = %target.display(),
        files = meta.files.len(),
        last_sequence = meta.last_sequence,
        "Restored backup"
    );
    Ok(())
}

/// The target must be absent or empty and not held by an open engine.
fn check_target(target: &Path) -> Result<()> {
    if FileLock::is_locked(target.join(LOCK_FILE))? {
        return Err(Error::Busy(format!(
            "{} is in use by an open engine",
            target.display()
        )));
    }
    match fs::read_dir(target) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(Error::InvalidArgument(format!(
                    "restore target {} is not empty",
                    target.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

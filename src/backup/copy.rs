use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hasher::{checksum_file, copy_hashed};
use crate::store::lsm::manifest::sync_parent;
use crate::Error;

/// `<path>.tmp`, where copies land before the rename.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Copies `src` (at most `limit` bytes) to `dst` through a temp file,
/// returning the bytes copied and their CRC-64. `dst` only appears once
/// complete.
pub fn copy_file(src: &Path, dst: &Path, limit: Option<u64>, sync: bool) -> Result<(u64, u64)> {
    let tmp = tmp_path(dst);
    let copied = (|| -> Result<(u64, u64)> {
        let reader = BufReader::new(File::open(src)?);
        let mut file = File::create(&tmp)?;
        let copied = copy_hashed(reader, BufWriter::new(&mut file), limit)?;
        if sync {
            file.sync_all()?;
        }
        Ok(copied)
    })();

    match copied {
        Ok(copied) => {
            fs::rename(&tmp, dst)?;
            if sync {
                sync_parent(dst)?;
            }
            Ok(copied)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Checks that `path` exists with the expected size and CRC-64.
pub fn verify_file(path: &Path, size: u64, checksum: u64) -> Result<()> {
    let actual_size = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if actual_size != size {
        return Err(Error::SizeMismatch {
            path: path.to_path_buf(),
            expected: size,
            actual: actual_size,
        });
    }

    let (_, actual) = checksum_file(path)?;
    if actual != checksum {
        return Err(Error::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: checksum,
            actual,
        });
    }
    Ok(())
}

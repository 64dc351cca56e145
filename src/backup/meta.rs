//! Backup generation metadata, stored as one JSON document per generation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::lsm::LevelMeta;
use crate::Error;

pub type BackupId = u64;

/// Progress of a backup generation. Only `Complete` generations can be
/// restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Enumerating,
    Copying,
    Finalizing,
    Verifying,
    Complete,
    Failed,
}

impl BackupState {
    pub fn is_in_progress(self) -> bool {
        !matches!(self, BackupState::Complete | BackupState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Table,
    Wal,
}

/// One file referenced by a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub kind: FileKind,
    /// Table or WAL segment id in the source database.
    pub id: u64,
    /// Location relative to the backup root.
    pub path: PathBuf,
    pub size: u64,
    /// CRC-64 of the file's contents.
    pub checksum: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMeta {
    pub id: BackupId,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub state: BackupState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_sequence: u64,
    pub next_table_id: u64,
    pub flushed_wal_id: u64,
    pub levels: Vec<LevelMeta>,
    pub files: Vec<BackupFile>,
}

impl BackupMeta {
    pub fn new(id: BackupId) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            id,
            timestamp,
            state: BackupState::Enumerating,
            error: None,
            last_sequence: 0,
            next_table_id: 1,
            flushed_wal_id: 0,
            levels: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Metadata files under `meta/`.
pub fn meta_path(root: &Path, id: BackupId) -> PathBuf {
    root.join("meta").join(format!("{id}.json"))
}

/// Writes `meta` through a temp file and an atomic rename.
pub fn save(root: &Path, meta: &BackupMeta, sync: bool) -> Result<()> {
    let path = meta_path(root, meta.id);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(meta)?;
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        if sync {
            file.sync_all()?;
        }
    }
    fs::rename(&tmp, &path)?;
    if sync {
        crate::store::lsm::manifest::sync_parent(&path)?;
    }
    Ok(())
}

pub fn load(root: &Path, id: BackupId) -> Result<BackupMeta> {
    let path = meta_path(root, id);
    let json = match fs::read(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("backup {id}")));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&json)?)
}

/// Every generation with a metadata file, in id order. Leftover temp files
/// are removed.
pub fn load_all(root: &Path) -> Result<Vec<BackupMeta>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(root.join("meta"))? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".tmp") {
            fs::remove_file(&path)?;
            continue;
        }
        if let Some(id) = name.strip_suffix(".json").and_then(|s| s.parse().ok()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    ids.into_iter().map(|id| load(root, id)).collect()
}

//! Backup configuration

use crate::error::{Error, Result};
use crate::store::{DEFAULT_NAME_LEN, MAX_NAME_LEN};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Absolute directory to back up.
    pub root: PathBuf,

    /// Content-addressed store directory; blobs and the sealed manifest
    /// archive land here.
    pub out_dir: PathBuf,

    /// Where the plaintext manifest is persisted.
    pub manifest_path: PathBuf,

    /// Worker threads for resolve and encryption. 0 means auto (CPU
    /// count with headroom).
    #[serde(default)]
    pub parallelism: usize,

    /// Blob file name length in base64 characters.
    #[serde(default = "default_name_len")]
    pub blob_name_len: usize,

    /// Manifest scope for diffing. Entries outside this prefix are left
    /// untouched; empty means the whole manifest belongs to `root`.
    #[serde(default)]
    pub prefix: String,
}

fn default_name_len() -> usize {
    DEFAULT_NAME_LEN
}

impl BackupConfig {
    /// A config for backing up `root` into `out_dir`, with the manifest
    /// stored alongside the blobs.
    pub fn new(root: PathBuf, out_dir: PathBuf) -> Self {
        let manifest_path = out_dir.join("manifest.json");
        BackupConfig {
            root,
            out_dir,
            manifest_path,
            parallelism: 0,
            blob_name_len: DEFAULT_NAME_LEN,
            prefix: String::new(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "backup root must be absolute: {}",
                self.root.display()
            )));
        }
        if self.blob_name_len == 0 || self.blob_name_len > MAX_NAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "blob_name_len must be in 1..={}, got {}",
                MAX_NAME_LEN, self.blob_name_len
            )));
        }
        Ok(())
    }
}

//! Restore driver
//!
//! Opens a manifest (sealed archive, plain tar member, or bare file),
//! then decrypts blobs out of a content-addressed store. Every blob is
//! authenticated up front by [`Reader`] construction; a missing blob is
//! reported and skipped, any other failure aborts the restore.

use crate::archive;
use crate::crypto::{Reader, HMAC_SIZE};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestEntry};
use crate::store::BlobStore;
use rsa::RsaPrivateKey;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Counters from one restore run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Files decrypted into the destination.
    pub restored: usize,
    /// Manifest entries whose blob was absent from the store.
    pub missing: usize,
}

/// Load a manifest from `path`.
///
/// Handles every form the backup side produces: a sealed archive (needs
/// `private`), a tar-wrapped plaintext manifest, or a bare manifest
/// file.
pub fn open_manifest(path: &Path, private: Option<&RsaPrivateKey>) -> Result<Manifest> {
    let file = File::open(path)?;
    archive::open_sealed(file, private)
}

/// Decrypt every manifest entry from `store` into `dest_dir`, creating
/// parent directories as needed.
pub fn restore_tree(
    manifest: &Manifest,
    store: &BlobStore,
    dest_dir: &Path,
) -> Result<RestoreSummary> {
    let mut summary = RestoreSummary::default();

    for entry in manifest.entries() {
        let dest = safe_join(dest_dir, &entry.relpath)?;
        let blob_path = store.blob_path(&entry.hmac);
        let blob = match File::open(&blob_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(relpath = %entry.relpath, blob = %blob_path.display(), "blob missing, skipped");
                summary.missing += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let reader = Reader::new(blob, entry.key.clone())?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&dest)?;
        reader.decrypt(&mut output)?;
        debug!(relpath = %entry.relpath, "restored");
        summary.restored += 1;
    }

    info!(restored = summary.restored, missing = summary.missing, "restore complete");
    Ok(summary)
}

/// Restore a single blob file to `dest`.
///
/// The matching entry is found by the blob's own trailer: the last 64
/// bytes are the HMAC the manifest indexes by.
pub fn restore_file(manifest: &Manifest, blob_path: &Path, dest: &Path) -> Result<ManifestEntry> {
    let mut blob = File::open(blob_path)?;
    blob.seek(SeekFrom::End(-(HMAC_SIZE as i64)))?;
    let mut hmac = [0u8; HMAC_SIZE];
    blob.read_exact(&mut hmac)?;
    blob.seek(SeekFrom::Start(0))?;

    let entry = manifest
        .find_entry_with_hmac(&hmac)
        .ok_or_else(|| Error::UnknownBlob(blob_path.display().to_string()))?;

    let reader = Reader::new(blob, entry.key.clone())?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut output = File::create(dest)?;
    reader.decrypt(&mut output)?;
    debug!(relpath = %entry.relpath, dest = %dest.display(), "restored single file");
    Ok(entry)
}

/// Join a manifest-supplied relative path onto the destination, refusing
/// anything that could escape it.
fn safe_join(dest_dir: &Path, relpath: &str) -> Result<PathBuf> {
    let rel = Path::new(relpath);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        return Err(Error::PathEscape(relpath.to_string()));
    }
    Ok(dest_dir.join(rel))
}

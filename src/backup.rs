//! Backup driver
//!
//! Orchestrates one incremental backup: scan, resolve against the
//! persisted manifest, diff, encrypt changed content into the store,
//! commit and save, optionally seal the manifest, then garbage-collect
//! orphaned blobs.
//!
//! The ordering is load-bearing: blob writes strictly precede the
//! manifest save, and the save strictly precedes GC unlinks. The
//! persisted manifest therefore never references a missing blob, and no
//! live blob is ever unlinked.

use crate::archive;
use crate::config::BackupConfig;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestEntry};
use crate::scan::{scan, ScanResult, SecretMap};
use crate::store::BlobStore;
use crate::worker;
use rsa::RsaPublicKey;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, warn};

/// Counters from one backup run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    /// Files the scanner emitted (excluding errored entries).
    pub scanned: usize,
    /// Entries inserted or replaced in the manifest.
    pub changed: usize,
    /// Fresh blobs written to the store.
    pub written: usize,
    /// Entries removed from the manifest.
    pub removed: usize,
    /// Orphaned blobs unlinked by the garbage collector.
    pub collected: usize,
}

/// Run one backup of `config.root` into `config.out_dir`.
///
/// When `recipient` is given, the saved manifest is additionally sealed
/// into `out_dir/manifest-encrypted.tar` for that key.
pub fn backup(
    config: &BackupConfig,
    secrets: &SecretMap,
    recipient: Option<&RsaPublicKey>,
) -> Result<BackupSummary> {
    config.validate()?;
    fs::create_dir_all(&config.out_dir)?;

    let results = scan(&config.root, secrets)?;
    let results = drop_errored(results);
    info!(root = %config.root.display(), files = results.len(), "scan complete");

    let manifest = Manifest::load_path(&config.manifest_path)?;

    let parallelism = if config.parallelism == 0 {
        worker::default_parallelism()
    } else {
        config.parallelism
    };

    let entries = manifest.resolve(&config.root, &results, parallelism)?;
    let diff = manifest.diff(&config.prefix, &entries);
    if diff.is_empty() {
        info!("no changes; manifest and store left untouched");
        return Ok(BackupSummary {
            scanned: results.len(),
            ..BackupSummary::default()
        });
    }
    info!(change = diff.change.len(), remove = diff.remove.len(), "diff computed");

    // Fan the changed entries out over the pool. Any failure aborts
    // before the manifest is touched.
    let store = BlobStore::with_name_len(config.out_dir.clone(), config.blob_name_len);
    let written = AtomicUsize::new(0);
    let jobs: Vec<&ManifestEntry> = diff.change.iter().collect();
    let outcomes = worker::map_unordered(parallelism, jobs, |entry| {
        let source = config.root.join(&entry.relpath);
        match store.store_file(&source, &entry.key, &entry.hmac) {
            Ok(true) => {
                written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                error!(relpath = %entry.relpath, error = %e, "encrypt failed");
                Err(e)
            }
        }
    });
    let failures = outcomes.iter().filter(|o| o.is_err()).count();
    if let Some(first) = outcomes.into_iter().find_map(Result::err) {
        error!(failures, "backup aborted before commit");
        return Err(first);
    }

    manifest.commit(&diff);
    manifest.save_path(&config.manifest_path).map_err(|e| match e {
        // The store now holds blobs the on-disk manifest does not
        // reference; that is recoverable, but flag it loudly.
        Error::Io(io) => Error::ManifestSave(io),
        other => other,
    })?;

    if let Some(recipient) = recipient {
        archive::seal_manifest(&config.manifest_path, &config.out_dir, recipient)?;
    }

    let mut collected = 0usize;
    for entry in manifest.garbage_collectable(&diff.remove) {
        match store.remove(&entry.hmac) {
            Ok(()) => collected += 1,
            Err(e) => {
                warn!(relpath = %entry.relpath, error = %e, "gc unlink failed, blob orphaned")
            }
        }
    }

    let summary = BackupSummary {
        scanned: results.len(),
        changed: diff.change.len(),
        written: written.into_inner(),
        removed: diff.remove.len(),
        collected,
    };
    info!(?summary, "backup complete");
    Ok(summary)
}

fn drop_errored(results: Vec<ScanResult>) -> Vec<ScanResult> {
    results
        .into_iter()
        .filter_map(|result| match result.error {
            Some(e) => {
                warn!(relpath = %result.relpath, error = %e, "skipping unreadable entry");
                None
            }
            None => Some(result),
        })
        .collect()
}

//! Directory scanning with hierarchical convergence secrets
//!
//! The scanner walks a root depth-first, skipping hidden entries, and
//! emits one result per regular file together with the governing
//! convergence secret. Secrets are configured per absolute path; the
//! deepest matching path wins, so a subtree or a single file can
//! override its parent's secret.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

/// Mapping from absolute directory (or file) path to convergence secret.
pub type SecretMap = BTreeMap<PathBuf, String>;

/// One scanned file, or the error that kept it from being read.
#[derive(Debug)]
pub struct ScanResult {
    /// Path relative to the scan root.
    pub relpath: String,
    /// Modification time; meaningless when `error` is set.
    pub mtime: SystemTime,
    /// File size in bytes; meaningless when `error` is set.
    pub size: u64,
    /// Governing convergence secret.
    pub secret: String,
    /// Error encountered while reading this entry. Errored entries are
    /// reported, not fatal: the walk continues past them.
    pub error: Option<io::Error>,
}

/// Walk `root` and return one [`ScanResult`] per non-hidden regular file.
///
/// Entries whose name starts with `.` are skipped, directories with
/// their whole subtree. Per-entry errors (permissions, races) are
/// attached to their result; only a failure to read the root itself
/// aborts the scan.
pub fn scan(root: &Path, secrets: &SecretMap) -> Result<Vec<ScanResult>> {
    if !root.is_absolute() {
        return Err(Error::InvalidConfig(format!(
            "scan root must be absolute: {}",
            root.display()
        )));
    }

    let mut resolver = SecretResolver::new(root, secrets);
    let mut results = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map(Path::to_path_buf);
                let err = io::Error::from(err);
                match path {
                    // The root itself was unreadable.
                    None => return Err(Error::Io(err)),
                    Some(path) if path == root => {
                        return Err(Error::Scan { path, source: err })
                    }
                    Some(path) => {
                        results.push(ScanResult {
                            relpath: relpath_of(root, &path),
                            mtime: SystemTime::UNIX_EPOCH,
                            size: 0,
                            secret: resolver.resolve(&path),
                            error: Some(err),
                        });
                        continue;
                    }
                }
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let abs = entry.path();
        let relpath = relpath_of(root, abs);
        let secret = resolver.resolve(abs);
        match entry.metadata() {
            Ok(meta) => {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                results.push(ScanResult {
                    relpath,
                    mtime,
                    size: meta.len(),
                    secret,
                    error: None,
                });
            }
            Err(err) => results.push(ScanResult {
                relpath,
                mtime: SystemTime::UNIX_EPOCH,
                size: 0,
                secret,
                error: Some(io::Error::from(err)),
            }),
        }
    }

    debug!(root = %root.display(), files = results.len(), "scan complete");
    Ok(results)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn relpath_of(root: &Path, abs: &Path) -> String {
    abs.strip_prefix(root)
        .unwrap_or(abs)
        .to_string_lossy()
        .into_owned()
}

/// Resolves the governing secret for a path: an exact entry wins, then
/// the nearest ancestor toward `/`, then the scan root's entry, then the
/// empty string. Directory lookups are memoized for the duration of one
/// scan.
struct SecretResolver<'a> {
    root: &'a Path,
    secrets: &'a SecretMap,
    cache: HashMap<PathBuf, String>,
}

impl<'a> SecretResolver<'a> {
    fn new(root: &'a Path, secrets: &'a SecretMap) -> Self {
        SecretResolver {
            root,
            secrets,
            cache: HashMap::new(),
        }
    }

    fn resolve(&mut self, abs: &Path) -> String {
        // File-level override.
        if let Some(secret) = self.secrets.get(abs) {
            return secret.clone();
        }
        let dir = abs.parent().unwrap_or(self.root);
        if let Some(secret) = self.cache.get(dir) {
            return secret.clone();
        }

        let resolved = dir
            .ancestors()
            .find_map(|ancestor| self.secrets.get(ancestor))
            .cloned()
            .unwrap_or_default();
        self.cache.insert(dir.to_path_buf(), resolved.clone());
        resolved
    }
}

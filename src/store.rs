//! Content-addressed blob store
//!
//! Blobs live in a flat directory, named by a prefix of the URL-safe
//! base64 of their HMAC. Identical content under the same secret maps to
//! the same name, so writes are naturally idempotent: a `stat` race
//! between two writers of the same blob is harmless.

use crate::crypto::{Key, Writer, HMAC_SIZE};
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::constant_time;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default blob-name length: 40 base64 characters keep at least 210
/// bits of the HMAC even on case-insensitive filesystems.
pub const DEFAULT_NAME_LEN: usize = 40;

/// Longest possible name: the full 64-byte HMAC in unpadded base64.
pub const MAX_NAME_LEN: usize = 86;

/// A directory of content-addressed blobs.
pub struct BlobStore {
    dir: PathBuf,
    name_len: usize,
}

impl BlobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self::with_name_len(dir, DEFAULT_NAME_LEN)
    }

    pub fn with_name_len(dir: PathBuf, name_len: usize) -> Self {
        BlobStore { dir, name_len }
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file name for a blob HMAC.
    pub fn blob_name(&self, hmac: &[u8; HMAC_SIZE]) -> String {
        let mut name = URL_SAFE_NO_PAD.encode(hmac);
        name.truncate(self.name_len);
        name
    }

    /// The full path for a blob HMAC.
    pub fn blob_path(&self, hmac: &[u8; HMAC_SIZE]) -> PathBuf {
        self.dir.join(self.blob_name(hmac))
    }

    pub fn contains(&self, hmac: &[u8; HMAC_SIZE]) -> bool {
        self.blob_path(hmac).exists()
    }

    /// Encrypt `source_path` into the store under `key`, skipping the
    /// write when the target blob already exists. Returns whether a new
    /// blob was written.
    ///
    /// The freshly computed HMAC must equal `expected_hmac` (the value
    /// recorded at resolve time); a mismatch means the file changed in
    /// between, the partial blob is unlinked, and the caller gets
    /// [`Error::HmacInvalid`].
    pub fn store_file(
        &self,
        source_path: &Path,
        key: &Key,
        expected_hmac: &[u8; HMAC_SIZE],
    ) -> Result<bool> {
        let target = self.blob_path(expected_hmac);
        if target.exists() {
            debug!(blob = %target.display(), "blob already present");
            return Ok(false);
        }

        let source = File::open(source_path)?;
        let mut output = File::create(&target)?;
        let written = Writer::new(source, key.clone()).encrypt(&mut output);

        let verified = written.and_then(|hmac| {
            constant_time::verify_slices_are_equal(&hmac, expected_hmac)
                .map_err(|_| Error::HmacInvalid)
        });
        if let Err(e) = verified {
            drop(output);
            if let Err(unlink) = fs::remove_file(&target) {
                warn!(blob = %target.display(), error = %unlink, "failed to unlink bad blob");
            }
            return Err(e);
        }

        debug!(source = %source_path.display(), blob = %target.display(), "blob written");
        Ok(true)
    }

    /// Unlink a blob. Missing blobs are not an error.
    pub fn remove(&self, hmac: &[u8; HMAC_SIZE]) -> io::Result<()> {
        match fs::remove_file(self.blob_path(hmac)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> BlobStore {
        BlobStore::new(dir.path().to_path_buf())
    }

    fn key_and_hmac(content: &[u8]) -> (Key, [u8; HMAC_SIZE]) {
        let mut source = Cursor::new(content.to_vec());
        let key = Key::convergent(b"", &mut source).unwrap();
        let hmac = Writer::new(source, key.clone())
            .encrypt(&mut io::sink())
            .unwrap();
        (key, hmac)
    }

    #[test]
    fn test_blob_name_is_truncated_base64url() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let name = s.blob_name(&[0xFF; HMAC_SIZE]);
        assert_eq!(name.len(), DEFAULT_NAME_LEN);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_store_file_writes_expected_blob() {
        let dir = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let path = src.path().join("f.txt");
        fs::write(&path, b"blob body").unwrap();

        let (key, hmac) = key_and_hmac(b"blob body");
        let s = store(&dir);
        s.store_file(&path, &key, &hmac).unwrap();

        assert!(s.contains(&hmac));
        let blob = fs::read(s.blob_path(&hmac)).unwrap();
        assert_eq!(blob.len(), b"blob body".len() + HMAC_SIZE);
    }

    #[test]
    fn test_store_file_skips_existing() {
        let dir = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let path = src.path().join("f.txt");
        fs::write(&path, b"same").unwrap();

        let (key, hmac) = key_and_hmac(b"same");
        let s = store(&dir);
        assert!(s.store_file(&path, &key, &hmac).unwrap());

        // Plant sentinel content; a second store must not rewrite it.
        fs::write(s.blob_path(&hmac), b"sentinel").unwrap();
        assert!(!s.store_file(&path, &key, &hmac).unwrap());
        assert_eq!(fs::read(s.blob_path(&hmac)).unwrap(), b"sentinel");
    }

    #[test]
    fn test_store_file_detects_changed_source() {
        let dir = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let path = src.path().join("f.txt");
        fs::write(&path, b"original").unwrap();
        let (key, hmac) = key_and_hmac(b"original");

        // Content changes between resolve and encrypt.
        fs::write(&path, b"tampered").unwrap();
        let s = store(&dir);
        assert!(matches!(
            s.store_file(&path, &key, &hmac),
            Err(Error::HmacInvalid)
        ));
        // The bad blob must not survive under the expected name.
        assert!(!s.contains(&hmac));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.remove(&[1; HMAC_SIZE]).unwrap();
    }
}

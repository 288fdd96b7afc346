//! Sealed manifest archives
//!
//! A sealed manifest is a pax tar with a single `manifest.json` member
//! whose body is the blob-encoded manifest under a fresh random key. The
//! key travels in the member's extended attributes, RSA-OAEP-encrypted
//! to the recipient:
//!
//! - `BLOBCRYPT.key`: standard base64 (no padding) of the wrapped key
//! - `BLOBCRYPT.key.type`: `oaep-aes256`
//!
//! The member's declared size is the plaintext manifest size plus the
//! 64-byte blob trailer.

use crate::crypto::{decrypt_and_check_key, open_key, seal_key, Key, Writer, HMAC_SIZE};
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Entry, Header};
use tracing::{debug, info};

/// Extended attribute carrying the wrapped symmetric key.
pub const SEALED_KEY_ATTR: &str = "BLOBCRYPT.key";

/// Extended attribute naming the key wrapping scheme.
pub const SEALED_KEY_TYPE_ATTR: &str = "BLOBCRYPT.key.type";

/// The only wrapping scheme we produce or accept.
pub const SEALED_KEY_TYPE: &str = "oaep-aes256";

/// Member name inside the archive.
pub const SEALED_MANIFEST_NAME: &str = "manifest.json";

/// File name of the archive in the output directory.
pub const SEALED_ARCHIVE_NAME: &str = "manifest-encrypted.tar";

/// Seal the manifest at `manifest_path` into
/// `out_dir/manifest-encrypted.tar` for `recipient`.
pub fn seal_manifest(
    manifest_path: &Path,
    out_dir: &Path,
    recipient: &RsaPublicKey,
) -> Result<PathBuf> {
    let key = Key::random();
    let wrapped = seal_key(recipient, &key)?;

    let manifest_file = File::open(manifest_path)?;
    let plain_len = manifest_file.metadata()?.len();
    let mut body = Vec::with_capacity(plain_len as usize + HMAC_SIZE);
    Writer::new(manifest_file, key).encrypt(&mut body)?;

    let archive_path = out_dir.join(SEALED_ARCHIVE_NAME);
    let mut builder = Builder::new(BufWriter::new(File::create(&archive_path)?));
    builder.append_pax_extensions([
        (SEALED_KEY_ATTR, STANDARD_NO_PAD.encode(&wrapped).as_bytes()),
        (SEALED_KEY_TYPE_ATTR, SEALED_KEY_TYPE.as_bytes()),
    ])?;

    let mut header = Header::new_ustar();
    header.set_path(SEALED_MANIFEST_NAME)?;
    header.set_size(plain_len + HMAC_SIZE as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append(&header, Cursor::new(body))?;

    builder.into_inner()?.flush()?;
    info!(archive = %archive_path.display(), "manifest sealed");
    Ok(archive_path)
}

/// Open a manifest from `source`, whatever form it is in.
///
/// A tar member with sealing attributes is unwrapped with `private`
/// (required in that case) and authenticated-decrypted; a member without
/// attributes is read as a plaintext manifest; a source that is not a
/// tar at all is rewound and loaded directly.
pub fn open_sealed<R: Read + Seek>(
    mut source: R,
    private: Option<&RsaPrivateKey>,
) -> Result<Manifest> {
    match read_tar_manifest(&mut source, private) {
        Ok(manifest) => Ok(manifest),
        Err(Error::ArchiveFormat(reason)) => {
            debug!(%reason, "not a sealed archive, trying bare manifest");
            source.seek(SeekFrom::Start(0))?;
            Manifest::load(source)
        }
        Err(e) => Err(e),
    }
}

fn read_tar_manifest<R: Read + Seek>(
    source: &mut R,
    private: Option<&RsaPrivateKey>,
) -> Result<Manifest> {
    source.seek(SeekFrom::Start(0))?;
    let mut archive = Archive::new(source);
    let entries = archive
        .entries()
        .map_err(|e| Error::ArchiveFormat(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::ArchiveFormat(e.to_string()))?;
        match sealed_key_of(&mut entry)? {
            Some(wrapped) => {
                let private = private.ok_or(Error::PrivateKeyRequired)?;
                let key = open_key(private, &wrapped)?;
                // Tar entries cannot seek, so authentication happens
                // alongside decryption into memory.
                let plaintext = decrypt_and_check_key(&mut entry, &key)?;
                return Manifest::load(&plaintext[..]);
            }
            None => {
                let mut body = Vec::new();
                entry.read_to_end(&mut body)?;
                return Manifest::load(&body[..]);
            }
        }
    }
    Err(Error::ArchiveFormat("archive has no members".into()))
}

/// Extract and decode the wrapped key from a member's pax records, if
/// present. A key record with a missing or unknown type is an error,
/// not a fallthrough to plaintext handling.
fn sealed_key_of<R: Read>(entry: &mut Entry<'_, R>) -> Result<Option<Vec<u8>>> {
    let Some(extensions) = entry.pax_extensions()? else {
        return Ok(None);
    };

    let mut wrapped = None;
    let mut key_type = None;
    for extension in extensions {
        let extension = extension.map_err(|e| Error::ArchiveFormat(e.to_string()))?;
        let Ok(key) = extension.key() else { continue };
        match key {
            SEALED_KEY_ATTR => {
                let encoded = extension
                    .value()
                    .map_err(|e| Error::ArchiveFormat(format!("bad {SEALED_KEY_ATTR}: {e}")))?;
                let decoded = STANDARD_NO_PAD
                    .decode(encoded)
                    .map_err(|e| Error::ArchiveFormat(format!("bad {SEALED_KEY_ATTR}: {e}")))?;
                wrapped = Some(decoded);
            }
            SEALED_KEY_TYPE_ATTR => {
                let value = extension
                    .value()
                    .map_err(|e| Error::ArchiveFormat(format!("bad {SEALED_KEY_TYPE_ATTR}: {e}")))?;
                key_type = Some(value.to_string());
            }
            _ => {}
        }
    }

    match wrapped {
        None => Ok(None),
        Some(wrapped) => match key_type.as_deref() {
            Some(SEALED_KEY_TYPE) => Ok(Some(wrapped)),
            Some(other) => Err(Error::SealedKeyType(other.to_string())),
            None => Err(Error::SealedKeyType("missing".into())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_private_key;
    use crate::fingerprint::Fingerprint;
    use crate::manifest::{ManifestDiff, ManifestEntry};
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    fn sample_manifest() -> Manifest {
        let manifest = Manifest::new();
        manifest.commit(&ManifestDiff {
            change: vec![
                ManifestEntry {
                    fingerprint: Fingerprint::compute("", "a.txt", UNIX_EPOCH, 1),
                    relpath: "a.txt".into(),
                    key: Key::new([1; 32]),
                    hmac: [1; HMAC_SIZE],
                },
                ManifestEntry {
                    fingerprint: Fingerprint::compute("", "b.txt", UNIX_EPOCH, 2),
                    relpath: "b.txt".into(),
                    key: Key::new([2; 32]),
                    hmac: [2; HMAC_SIZE],
                },
            ],
            remove: Vec::new(),
        });
        manifest
    }

    fn entries_sorted(manifest: &Manifest) -> Vec<ManifestEntry> {
        let mut entries = manifest.entries();
        entries.sort_by(|a, b| a.relpath.cmp(&b.relpath));
        entries
    }

    fn seal_sample(dir: &TempDir) -> (Manifest, PathBuf) {
        let manifest = sample_manifest();
        let manifest_path = dir.path().join("manifest.json");
        manifest.save_path(&manifest_path).unwrap();

        let public = RsaPublicKey::from(test_private_key());
        let archive_path = seal_manifest(&manifest_path, dir.path(), &public).unwrap();
        (manifest, archive_path)
    }

    #[test]
    fn test_seal_and_open_round_trip() {
        let dir = TempDir::new().unwrap();
        let (original, archive_path) = seal_sample(&dir);

        let opened =
            open_sealed(File::open(archive_path).unwrap(), Some(test_private_key())).unwrap();
        assert_eq!(entries_sorted(&original), entries_sorted(&opened));
    }

    #[test]
    fn test_member_size_is_plaintext_plus_trailer() {
        let dir = TempDir::new().unwrap();
        let (_, archive_path) = seal_sample(&dir);
        let plain_len = std::fs::metadata(dir.path().join("manifest.json"))
            .unwrap()
            .len();

        let mut archive = Archive::new(File::open(archive_path).unwrap());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some(SEALED_MANIFEST_NAME));
        assert_eq!(entry.size(), plain_len + HMAC_SIZE as u64);
    }

    #[test]
    fn test_sealed_without_private_key_fails() {
        let dir = TempDir::new().unwrap();
        let (_, archive_path) = seal_sample(&dir);

        assert!(matches!(
            open_sealed(File::open(archive_path).unwrap(), None),
            Err(Error::PrivateKeyRequired)
        ));
    }

    #[test]
    fn test_unknown_key_type_rejected() {
        let dir = TempDir::new().unwrap();
        let archive_path = dir.path().join("bad.tar");

        let mut builder = Builder::new(File::create(&archive_path).unwrap());
        builder
            .append_pax_extensions([
                (SEALED_KEY_ATTR, b"AAAA".as_slice()),
                (SEALED_KEY_TYPE_ATTR, b"rot13-des".as_slice()),
            ])
            .unwrap();
        let mut header = Header::new_ustar();
        header.set_path(SEALED_MANIFEST_NAME).unwrap();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append(&header, Cursor::new(Vec::new())).unwrap();
        builder.into_inner().unwrap().flush().unwrap();

        assert!(matches!(
            open_sealed(File::open(archive_path).unwrap(), Some(test_private_key())),
            Err(Error::SealedKeyType(t)) if t == "rot13-des"
        ));
    }

    #[test]
    fn test_plain_member_without_attributes() {
        let dir = TempDir::new().unwrap();
        let manifest = sample_manifest();
        let mut body = Vec::new();
        manifest.save(&mut body).unwrap();

        let archive_path = dir.path().join("plain.tar");
        let mut builder = Builder::new(File::create(&archive_path).unwrap());
        let mut header = Header::new_ustar();
        header.set_path(SEALED_MANIFEST_NAME).unwrap();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append(&header, Cursor::new(body)).unwrap();
        builder.into_inner().unwrap().flush().unwrap();

        let opened = open_sealed(File::open(archive_path).unwrap(), None).unwrap();
        assert_eq!(entries_sorted(&manifest), entries_sorted(&opened));
    }

    #[test]
    fn test_bare_manifest_file_fallback() {
        let manifest = sample_manifest();
        let mut body = Vec::new();
        manifest.save(&mut body).unwrap();

        let opened = open_sealed(Cursor::new(body), None).unwrap();
        assert_eq!(entries_sorted(&manifest), entries_sorted(&opened));
    }

    #[test]
    fn test_tampered_sealed_body_rejected() {
        let dir = TempDir::new().unwrap();
        let (_, archive_path) = seal_sample(&dir);

        let mut bytes = std::fs::read(&archive_path).unwrap();
        // Flip a bit inside the member body, past the pax and ustar
        // header blocks.
        let body_start = {
            let mut archive = Archive::new(File::open(&archive_path).unwrap());
            let entry = archive.entries().unwrap().next().unwrap().unwrap();
            entry.raw_file_position() as usize
        };
        bytes[body_start + 10] ^= 0x01;

        assert!(matches!(
            open_sealed(Cursor::new(bytes), Some(test_private_key())),
            Err(Error::HmacInvalid)
        ));
    }
}

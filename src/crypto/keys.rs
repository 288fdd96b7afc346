//! Key derivation for the convergent codec
//!
//! A blob's key is SHA-256 over the convergence secret followed by the
//! plaintext, so identical content under the same secret always encrypts
//! to identical bytes. Everything else is derived from the key: the CTR
//! IV is SHA-256(key) and the trailer HMAC key is SHA-256 of that.

use crate::crypto::{IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::digest::{self, SHA256};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use zeroize::Zeroize;

/// A 32-byte symmetric blob key.
///
/// Convergent keys are derivable by anyone holding the plaintext and the
/// secret, but the `Debug` form is still redacted so keys drawn for
/// manifest sealing cannot leak through logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Wrap raw key material.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }

    /// Build a key from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| Error::KeySize {
            expected: KEY_SIZE,
            got: bytes.len(),
        })?;
        Ok(Key(arr))
    }

    /// Compute the convergent key for `source`: SHA-256 over
    /// `secret || plaintext`.
    ///
    /// The source is rewound to offset 0 before returning, so the same
    /// handle can be passed straight to [`crate::crypto::Writer`].
    pub fn convergent<R: Read + Seek>(secret: &[u8], source: &mut R) -> io::Result<Self> {
        let mut ctx = digest::Context::new(&SHA256);
        ctx.update(secret);

        let mut buf = [0u8; 16 * 1024];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => ctx.update(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let hash = ctx.finish();

        source.seek(SeekFrom::Start(0))?;
        Ok(Key(hash.as_ref().try_into().expect("SHA-256 output is 32 bytes")))
    }

    /// Draw a fresh random key for manifest sealing.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Key(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(..)")
    }
}

impl Zeroize for Key {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// The deterministic subkeys of a blob key.
///
/// `iv` is the full SHA-256 of the key; the CTR transform uses only its
/// first [`IV_SIZE`] bytes, while the HMAC key hashes all 32.
pub(crate) struct Subkeys {
    iv: [u8; KEY_SIZE],
    hmac_key: [u8; KEY_SIZE],
}

impl Subkeys {
    pub fn derive(key: &Key) -> Self {
        let iv = sha256(key.as_bytes());
        let hmac_key = sha256(&iv);
        Subkeys { iv, hmac_key }
    }

    /// The 16-byte IV for AES-256-CTR.
    pub fn ctr_iv(&self) -> [u8; IV_SIZE] {
        self.iv[..IV_SIZE].try_into().expect("IV_SIZE <= KEY_SIZE")
    }

    /// The keyed HMAC-SHA-512 context for the trailer.
    pub fn hmac(&self) -> hmac::Context {
        let key = hmac::Key::new(hmac::HMAC_SHA512, &self.hmac_key);
        hmac::Context::with_key(&key)
    }
}

fn sha256(input: &[u8]) -> [u8; KEY_SIZE] {
    digest::digest(&SHA256, input)
        .as_ref()
        .try_into()
        .expect("SHA-256 output is 32 bytes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HMAC_SIZE;
    use std::io::Cursor;

    #[test]
    fn test_convergent_key_deterministic() {
        let mut a = Cursor::new(b"some file content".to_vec());
        let mut b = Cursor::new(b"some file content".to_vec());

        let ka = Key::convergent(b"secret", &mut a).unwrap();
        let kb = Key::convergent(b"secret", &mut b).unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn test_convergent_key_depends_on_secret() {
        let mut a = Cursor::new(b"some file content".to_vec());
        let mut b = Cursor::new(b"some file content".to_vec());

        let ka = Key::convergent(b"A", &mut a).unwrap();
        let kb = Key::convergent(b"B", &mut b).unwrap();
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_convergent_key_rewinds_source() {
        let mut source = Cursor::new(b"content".to_vec());
        Key::convergent(b"", &mut source).unwrap();
        assert_eq!(source.position(), 0);
    }

    #[test]
    fn test_from_slice_rejects_bad_length() {
        assert!(matches!(
            Key::from_slice(&[0u8; 31]),
            Err(Error::KeySize { expected: 32, got: 31 })
        ));
        assert!(Key::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_subkeys_match_reference_derivation() {
        // IV = SHA-256(key), HMAC key = SHA-256(IV), with the full
        // 32-byte IV feeding the second hash.
        let key = Key::new([7u8; 32]);
        let subkeys = Subkeys::derive(&key);

        let iv = sha256(key.as_bytes());
        assert_eq!(subkeys.ctr_iv(), iv[..IV_SIZE]);
        assert_eq!(subkeys.hmac_key, sha256(&iv));
    }

    #[test]
    fn test_random_keys_differ() {
        assert_ne!(Key::random(), Key::random());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = Key::random();
        assert_eq!(format!("{:?}", key), "Key(..)");
    }

    #[test]
    fn test_hmac_context_produces_64_byte_tags() {
        let subkeys = Subkeys::derive(&Key::new([0u8; 32]));
        let mut ctx = subkeys.hmac();
        ctx.update(b"payload");
        assert_eq!(ctx.sign().as_ref().len(), HMAC_SIZE);
    }
}

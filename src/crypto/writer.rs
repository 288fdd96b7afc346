//! Blob encryption
//!
//! A blob is the AES-256-CTR ciphertext of the source followed by a
//! 64-byte HMAC-SHA-512 trailer over the ciphertext. The returned HMAC
//! doubles as the blob's content address.

use crate::crypto::{Aes256Ctr, CipherStream, Key, Subkeys, HMAC_SIZE};
use crate::error::Result;
use ctr::cipher::KeyIvInit;
use std::io::{Read, Seek, Write};
use std::thread;

/// Encrypts the contents of an underlying seekable source.
pub struct Writer<R> {
    source: R,
    key: Key,
}

impl<R: Read + Seek + Send> Writer<R> {
    /// Create a writer that encrypts `source` under `key`.
    ///
    /// The source must be positioned at offset 0.
    pub fn new(source: R, key: Key) -> Self {
        Writer { source, key }
    }

    /// Encrypt the source to `output`, appending the HMAC trailer.
    ///
    /// Enciphering runs on a background thread, overlapped with the
    /// output writes. Returns the 64-byte trailer; on error the output
    /// contents are undefined.
    pub fn encrypt<W: Write>(&mut self, output: &mut W) -> Result<[u8; HMAC_SIZE]> {
        let subkeys = Subkeys::derive(&self.key);
        let cipher = Aes256Ctr::new(self.key.as_bytes().into(), &subkeys.ctr_iv().into());
        let mut mac = subkeys.hmac();

        thread::scope(|s| -> Result<()> {
            let stream = CipherStream::spawn(s, &mut self.source, cipher);
            while let Some(chunk) = stream.recv() {
                let chunk = chunk?;
                mac.update(&chunk);
                output.write_all(&chunk)?;
                stream.recycle(chunk);
            }
            Ok(())
        })?;

        let tag = mac.sign();
        output.write_all(tag.as_ref())?;

        let mut hmac = [0u8; HMAC_SIZE];
        hmac.copy_from_slice(tag.as_ref());
        Ok(hmac)
    }

    /// Consume the writer and hand the source back.
    pub fn into_inner(self) -> R {
        self.source
    }
}

//! Asymmetric envelope for sealed manifests
//!
//! The manifest is encrypted under a fresh random symmetric key, and the
//! key itself travels RSA-OAEP-encrypted to the recipient. SHA-256 is
//! the OAEP mask hash and the label is the literal string
//! `symmetric-key`; both sides must agree on both.

use crate::crypto::Key;
use crate::error::{Error, Result};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

/// OAEP label shared by seal and open.
pub const OAEP_LABEL: &str = "symmetric-key";

/// Smallest acceptable RSA modulus.
pub const MIN_RSA_BITS: usize = 4096;

fn padding() -> Oaep {
    Oaep::new_with_label::<Sha256, _>(OAEP_LABEL)
}

fn require_min_size(bits: usize) -> Result<()> {
    if bits < MIN_RSA_BITS {
        return Err(Error::RsaKeySize {
            bits,
            min: MIN_RSA_BITS,
        });
    }
    Ok(())
}

/// Encrypt a symmetric key to `recipient`.
pub fn seal_key(recipient: &RsaPublicKey, key: &Key) -> Result<Vec<u8>> {
    require_min_size(recipient.size() * 8)?;
    let wrapped = recipient.encrypt(&mut rand::thread_rng(), padding(), key.as_bytes())?;
    Ok(wrapped)
}

/// Decrypt a symmetric key wrapped by [`seal_key`].
pub fn open_key(private: &RsaPrivateKey, wrapped: &[u8]) -> Result<Key> {
    require_min_size(private.size() * 8)?;
    let bytes = Zeroizing::new(private.decrypt(padding(), wrapped)?);
    Key::from_slice(&bytes)
}

//! Cryptography module for blobcrypt
//!
//! Implements the convergent blob codec: keys derived from content,
//! AES-256-CTR streaming, and an HMAC-SHA-512 authentication trailer.

mod envelope;
mod keys;
mod reader;
mod stream;
mod writer;

pub use envelope::{open_key, seal_key, MIN_RSA_BITS, OAEP_LABEL};
pub use keys::Key;
pub use reader::{check_key, decrypt_and_check_key, Reader, TailExcludingReader};
pub use writer::Writer;

pub(crate) use keys::Subkeys;
pub(crate) use stream::CipherStream;

#[cfg(test)]
pub(crate) use envelope::tests::test_private_key;

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the CTR initialization vector in bytes
pub const IV_SIZE: usize = 16;

/// Size of the HMAC-SHA-512 trailer in bytes
pub const HMAC_SIZE: usize = 64;

/// AES-256 in CTR mode with a big-endian full-block counter
pub(crate) type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

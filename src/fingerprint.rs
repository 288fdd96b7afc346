//! Fast change-detection fingerprints
//!
//! A fingerprint hashes a file's governing secret, relative path, mtime
//! and size. It exists purely to decide whether a file needs
//! re-encryption; a collision just means the content hash is recomputed,
//! so nothing here is security-relevant.

use ring::digest::{self, SHA256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of a fingerprint in bytes.
pub const FINGERPRINT_SIZE: usize = 32;

/// SHA-256 over `secret || 0 || relpath || 0 || mtime || 0 || varint(size)`.
///
/// The zero separators keep field boundaries unambiguous. The mtime
/// encoding is fixed as 12 little-endian bytes, `i64` seconds since the
/// Unix epoch followed by `u32` subsecond nanoseconds; the size is a
/// zigzag LEB128 varint. Any change to either encoding invalidates every
/// stored fingerprint, forcing a full (but harmless) re-resolve.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn compute(secret: &str, relpath: &str, mtime: SystemTime, size: u64) -> Self {
        let mut ctx = digest::Context::new(&SHA256);
        ctx.update(secret.as_bytes());
        ctx.update(&[0]);
        ctx.update(relpath.as_bytes());
        ctx.update(&[0]);
        ctx.update(&encode_mtime(mtime));
        ctx.update(&[0]);

        let mut varint = [0u8; 10];
        let n = encode_varint(size as i64, &mut varint);
        ctx.update(&varint[..n]);

        let hash = ctx.finish();
        Fingerprint(
            hash.as_ref()
                .try_into()
                .expect("SHA-256 output is 32 bytes"),
        )
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..8]))
    }
}

/// 12 bytes little-endian: i64 epoch seconds, then u32 nanoseconds.
fn encode_mtime(mtime: SystemTime) -> [u8; 12] {
    let (secs, nanos) = match mtime.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        // Pre-epoch: negative seconds with nanos normalized into [0, 1e9).
        Err(e) => {
            let d = e.duration();
            if d.subsec_nanos() == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
            }
        }
    };

    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&secs.to_le_bytes());
    out[8..].copy_from_slice(&nanos.to_le_bytes());
    out
}

/// Zigzag LEB128, as used by signed varints on the wire.
fn encode_varint(value: i64, out: &mut [u8; 10]) -> usize {
    let mut v = ((value << 1) ^ (value >> 63)) as u64;
    let mut i = 0;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out[i] = byte;
            return i + 1;
        }
        out[i] = byte | 0x80;
        i += 1;
    }
}

//! Blob authentication and decryption
//!
//! The seekable path authenticates the whole blob before a single byte
//! of plaintext is produced. The non-seekable path exists only for
//! tar-embedded manifests, which must be read sequentially; it buffers
//! the plaintext and zeroes it if authentication fails.

use crate::crypto::{Aes256Ctr, CipherStream, Key, Subkeys, HMAC_SIZE};
use crate::error::{Error, Result};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ring::constant_time;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::thread;
use zeroize::Zeroize;

/// Authenticate a seekable ciphertext against `key`.
///
/// HMACs everything before the 64-byte trailer and compares in constant
/// time. The source is rewound to offset 0 before returning. Returns the
/// body length (the trailer offset).
pub fn check_key<R: Read + Seek>(source: &mut R, key: &Key) -> Result<u64> {
    let subkeys = Subkeys::derive(key);

    let trailer_pos = source.seek(SeekFrom::End(-(HMAC_SIZE as i64)))?;
    let mut embedded = [0u8; HMAC_SIZE];
    source.read_exact(&mut embedded)?;

    source.seek(SeekFrom::Start(0))?;
    let mut mac = subkeys.hmac();
    let mut remaining = trailer_pos;
    let mut buf = [0u8; 16 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = match source.read(&mut buf[..want]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        mac.update(&buf[..n]);
        remaining -= n as u64;
    }

    let computed = mac.sign();
    constant_time::verify_slices_are_equal(computed.as_ref(), &embedded)
        .map_err(|_| Error::HmacInvalid)?;

    source.seek(SeekFrom::Start(0))?;
    Ok(trailer_pos)
}

/// Decrypts the contents of an authenticated blob.
///
/// Construction authenticates via [`check_key`]; an invalid or tampered
/// source never yields a reader.
pub struct Reader<R> {
    source: R,
    key: Key,
    body_len: u64,
}

impl<R: Read + Seek + Send> Reader<R> {
    /// Authenticate `source` under `key` and return a reader for it.
    pub fn new(mut source: R, key: Key) -> Result<Self> {
        let body_len = check_key(&mut source, &key)?;
        Ok(Reader {
            source,
            key,
            body_len,
        })
    }

    /// Length of the plaintext body.
    pub fn body_len(&self) -> u64 {
        self.body_len
    }

    /// Stream the decrypted body to `output`.
    pub fn decrypt<W: Write>(mut self, output: &mut W) -> Result<()> {
        let subkeys = Subkeys::derive(&self.key);
        let cipher = Aes256Ctr::new(self.key.as_bytes().into(), &subkeys.ctr_iv().into());

        thread::scope(|s| -> Result<()> {
            let body = (&mut self.source).take(self.body_len);
            let stream = CipherStream::spawn(s, body, cipher);
            while let Some(chunk) = stream.recv() {
                let chunk = chunk?;
                output.write_all(&chunk)?;
                stream.recycle(chunk);
            }
            Ok(())
        })
    }
}

/// A reader that always withholds the last `tail_size` bytes of its
/// source, handing earlier bytes through normally. Once the source hits
/// EOF the withheld bytes stay available via [`tail`](Self::tail).
pub struct TailExcludingReader<R> {
    inner: R,
    tail_size: usize,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: Read> TailExcludingReader<R> {
    pub fn new(inner: R, tail_size: usize) -> Self {
        TailExcludingReader {
            inner,
            tail_size,
            buf: Vec::with_capacity(tail_size),
            eof: false,
        }
    }

    /// The withheld trailing bytes. Complete only after EOF; shorter if
    /// the source itself was shorter than the tail.
    pub fn tail(&self) -> &[u8] {
        &self.buf
    }
}

impl<R: Read> Read for TailExcludingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        // Keep the buffer topped up to the requested size plus the tail,
        // so the tail is never handed out.
        let want = out.len() + self.tail_size;
        let mut scratch = [0u8; 8 * 1024];
        while self.buf.len() < want && !self.eof {
            let room = scratch.len().min(want - self.buf.len());
            match self.inner.read(&mut scratch[..room]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let avail = self.buf.len().saturating_sub(self.tail_size);
        if avail == 0 {
            // Nothing but tail left; EOF for the consumer.
            return Ok(0);
        }
        let n = avail.min(out.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.drain(..n);
        Ok(n)
    }
}

/// Authenticate and decrypt a non-seekable ciphertext into memory.
///
/// Authentication cannot happen before decryption here, so the plaintext
/// is buffered while every byte except the withheld 64-byte tail feeds a
/// running HMAC. On mismatch the buffer is zeroed before the error
/// surfaces; no plaintext ever reaches the caller.
///
/// Whenever the source can seek, prefer [`Reader`], which authenticates
/// up front and buffers nothing.
pub fn decrypt_and_check_key<R: Read>(source: R, key: &Key) -> Result<Vec<u8>> {
    let subkeys = Subkeys::derive(key);
    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), &subkeys.ctr_iv().into());
    let mut mac = subkeys.hmac();

    let mut tail = TailExcludingReader::new(source, HMAC_SIZE);
    let mut plaintext = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match tail.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                plaintext.zeroize();
                return Err(e.into());
            }
        };
        let chunk = &mut buf[..n];
        mac.update(chunk);
        cipher.apply_keystream(chunk);
        plaintext.extend_from_slice(chunk);
    }

    let computed = mac.sign();
    if constant_time::verify_slices_are_equal(computed.as_ref(), tail.tail()).is_err() {
        buf.zeroize();
        plaintext.zeroize();
        return Err(Error::HmacInvalid);
    }
    buf.zeroize();
    Ok(plaintext)
}

//! Threaded cipher streaming
//!
//! The CTR transform usually outruns the output sink, so enciphering the
//! next chunk while the previous one is being written yields a solid
//! throughput win. The producer runs on its own scoped thread and hands
//! owned buffers to the consumer through a capacity-1 channel.

use crate::crypto::Aes256Ctr;
use crossbeam_channel::{bounded, Receiver, Sender};
use ctr::cipher::StreamCipher;
use std::io::{self, Read};
use std::thread::Scope;

/// Number of rotating buffers: one filling, one in flight, one with the
/// consumer.
const STREAM_BUFFERS: usize = 3;

/// Size of each rotating buffer.
const STREAM_BUFFER_SIZE: usize = 16 * 1024;

/// Consumer handle for a spawned cipher stream.
///
/// Chunks arrive in source order; a read failure arrives as the final
/// `Err` item and EOF closes the channel. Dropping the handle cancels
/// the producer: a blocked send observes the disconnect and the thread
/// exits without further emission.
pub(crate) struct CipherStream {
    chunks: Receiver<io::Result<Vec<u8>>>,
    recycle: Sender<Vec<u8>>,
}

impl CipherStream {
    /// Start the producer on `scope`, reading plaintext (or ciphertext,
    /// the XOR transform is its own inverse) from `source`.
    pub fn spawn<'scope, R>(
        scope: &'scope Scope<'scope, '_>,
        mut source: R,
        mut cipher: Aes256Ctr,
    ) -> Self
    where
        R: Read + Send + 'scope,
    {
        let (chunk_tx, chunk_rx) = bounded::<io::Result<Vec<u8>>>(1);
        let (recycle_tx, recycle_rx) = bounded::<Vec<u8>>(STREAM_BUFFERS);

        scope.spawn(move || {
            for round in 0usize.. {
                // Allocate the first few buffers, then block until the
                // consumer hands one back. Backpressure keeps at most
                // STREAM_BUFFERS * STREAM_BUFFER_SIZE bytes alive.
                let mut buf = if round < STREAM_BUFFERS {
                    vec![0u8; STREAM_BUFFER_SIZE]
                } else {
                    match recycle_rx.recv() {
                        Ok(buf) => buf,
                        // Consumer is gone; stop quietly.
                        Err(_) => return,
                    }
                };
                buf.resize(STREAM_BUFFER_SIZE, 0);

                let n = match read_retrying(&mut source, &mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = chunk_tx.send(Err(e));
                        return;
                    }
                };
                if n == 0 {
                    // EOF: dropping chunk_tx closes the channel cleanly.
                    return;
                }

                buf.truncate(n);
                cipher.apply_keystream(&mut buf);
                if chunk_tx.send(Ok(buf)).is_err() {
                    // Canceled while blocked on send.
                    return;
                }
            }
        });

        CipherStream {
            chunks: chunk_rx,
            recycle: recycle_tx,
        }
    }

    /// Receive the next enciphered chunk, or `None` on clean EOF.
    pub fn recv(&self) -> Option<io::Result<Vec<u8>>> {
        self.chunks.recv().ok()
    }

    /// Return a spent buffer to the producer's rotation.
    pub fn recycle(&self, buf: Vec<u8>) {
        // The producer may already have exited at EOF; that's fine.
        let _ = self.recycle.send(buf);
    }
}

fn read_retrying<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctr::cipher::KeyIvInit;
    use std::io::Cursor;
    use std::thread;

    fn test_cipher() -> Aes256Ctr {
        Aes256Ctr::new(&[0u8; 32].into(), &[0u8; 16].into())
    }

    fn collect(source: Vec<u8>) -> io::Result<Vec<u8>> {
        thread::scope(|s| {
            let stream = CipherStream::spawn(s, Cursor::new(source), test_cipher());
            let mut out = Vec::new();
            while let Some(chunk) = stream.recv() {
                let chunk = chunk?;
                out.extend_from_slice(&chunk);
                stream.recycle(chunk);
            }
            Ok(out)
        })
    }

    #[test]
    fn test_stream_preserves_length_and_order() {
        // Spans multiple buffers with a partial final chunk.
        let plaintext: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let ciphertext = collect(plaintext.clone()).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len());

        // The CTR transform is an involution: running the ciphertext
        // through a fresh stream restores the input in order.
        let roundtrip = collect(ciphertext).unwrap();
        assert_eq!(roundtrip, plaintext);
    }

    #[test]
    fn test_empty_source_closes_cleanly() {
        let out = collect(Vec::new()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_read_error_is_surfaced_last() {
        struct FailAfter {
            remaining: usize,
        }
        impl Read for FailAfter {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.remaining == 0 {
                    return Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
                }
                let n = buf.len().min(self.remaining);
                self.remaining -= n;
                buf[..n].fill(0xAB);
                Ok(n)
            }
        }

        thread::scope(|s| {
            let stream = CipherStream::spawn(s, FailAfter { remaining: 40_000 }, test_cipher());
            let mut got_data = 0usize;
            let mut saw_error = false;
            while let Some(chunk) = stream.recv() {
                match chunk {
                    Ok(chunk) => {
                        got_data += chunk.len();
                        stream.recycle(chunk);
                    }
                    Err(e) => {
                        assert_eq!(e.to_string(), "disk on fire");
                        saw_error = true;
                    }
                }
            }
            assert_eq!(got_data, 40_000);
            assert!(saw_error);
        });
    }

    #[test]
    fn test_drop_cancels_blocked_producer() {
        // An endless source; the producer fills its buffers, blocks on
        // send, and must exit when the handle is dropped or the scope
        // would never join.
        struct Endless;
        impl Read for Endless {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                buf.fill(0x55);
                Ok(buf.len())
            }
        }

        thread::scope(|s| {
            let stream = CipherStream::spawn(s, Endless, test_cipher());
            let first = stream.recv().unwrap().unwrap();
            assert_eq!(first.len(), STREAM_BUFFER_SIZE);
            drop(stream);
        });
    }
}

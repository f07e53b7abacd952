//! The "safe" stream codec: everything stored at the remote goes through
//! this compress-then-encrypt framing.
//!
//! Blob layout: a 5-byte magic, a 16-byte random salt, a sequence of frames,
//! and a zero length marking end of stream. Each frame is a little-endian
//! `u32` length followed by a 12-byte nonce and the AEAD-sealed,
//! zlib-compressed chunk of the logical stream. The key is derived from the
//! configured passphrase and the blob's salt with Argon2id, so every blob
//! encrypts under its own key.
//!
//! Offsets recorded in indexes address the logical (pre-codec) stream; blob
//! sizes recorded in indexes are wire (post-codec) sizes.

use crate::remote::BlobWrite;
use crate::{Error, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::RngCore;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

const MAGIC: &[u8; 5] = b"safe1";
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const FRAME_SIZE: usize = 128 * 1024;

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<Key> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| Error::Config(format!("deriving key from passphrase: {}", e)))?;
    Ok(*Key::from_slice(&key))
}

pub struct SafeWriter<W: BlobWrite> {
    out: W,
    cipher: ChaCha20Poly1305,
    buf: Vec<u8>,
}

impl<W: BlobWrite> SafeWriter<W> {
    pub async fn new(mut out: W, passphrase: &str) -> Result<SafeWriter<W>> {
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let key = derive_key(passphrase, &salt)?;
        out.write(MAGIC).await?;
        out.write(&salt).await?;
        Ok(SafeWriter {
            out,
            cipher: ChaCha20Poly1305::new(&key),
            buf: Vec::with_capacity(FRAME_SIZE),
        })
    }

    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = (FRAME_SIZE - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == FRAME_SIZE {
                self.flush_frame().await?;
            }
        }
        Ok(())
    }

    async fn flush_frame(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&self.buf)?;
        let compressed = enc.finish()?;
        self.buf.clear();
        let nonce = ChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, compressed.as_slice())
            .map_err(|e| Error::Io(std::io::Error::other(format!("sealing frame: {}", e))))?;
        let len = (NONCE_SIZE + sealed.len()) as u32;
        self.out.write(&len.to_le_bytes()).await?;
        self.out.write(nonce.as_slice()).await?;
        self.out.write(&sealed).await?;
        Ok(())
    }

    /// Flush buffered data, write the end-of-stream marker and finish the
    /// underlying blob.
    pub async fn finish(&mut self) -> Result<()> {
        self.flush_frame().await?;
        self.out.write(&0u32.to_le_bytes()).await?;
        self.out.finish().await
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

pub struct SafeReader<R> {
    inner: R,
    cipher: ChaCha20Poly1305,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: AsyncRead + Send + Unpin> SafeReader<R> {
    pub async fn new(mut inner: R, passphrase: &str) -> Result<SafeReader<R>> {
        let mut header = [0u8; MAGIC.len() + SALT_SIZE];
        inner
            .read_exact(&mut header)
            .await
            .map_err(|_| Error::CodecAuth)?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(Error::CodecAuth);
        }
        let key = derive_key(passphrase, &header[MAGIC.len()..])?;
        Ok(SafeReader {
            inner,
            cipher: ChaCha20Poly1305::new(&key),
            buf: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    /// Decrypt the next frame into the buffer. False at clean end of stream.
    async fn fill(&mut self) -> Result<bool> {
        let mut len_bytes = [0u8; 4];
        self.inner
            .read_exact(&mut len_bytes)
            .await
            .map_err(read_error)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 {
            self.done = true;
            return Ok(false);
        }
        if len <= NONCE_SIZE {
            return Err(Error::CodecAuth);
        }
        let mut frame = vec![0u8; len];
        self.inner.read_exact(&mut frame).await.map_err(read_error)?;
        let (nonce, sealed) = frame.split_at(NONCE_SIZE);
        let compressed = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::CodecAuth)?;
        self.buf.clear();
        self.pos = 0;
        let mut dec = ZlibDecoder::new(compressed.as_slice());
        dec.read_to_end(&mut self.buf).map_err(|_| Error::CodecAuth)?;
        Ok(true)
    }

    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        while self.pos == self.buf.len() {
            if self.done || !self.fill().await? {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    pub async fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < out.len() {
            let n = self.read(&mut out[off..]).await?;
            if n == 0 {
                return Err(Error::DataTruncated(format!(
                    "expected {} more bytes",
                    out.len() - off
                )));
            }
            off += n;
        }
        Ok(())
    }

    /// Discard `n` bytes of the logical stream.
    pub async fn skip(&mut self, mut n: u64) -> Result<()> {
        while n > 0 {
            if self.pos == self.buf.len() && (self.done || !self.fill().await?) {
                return Err(Error::DataTruncated(format!(
                    "expected {} more bytes while skipping",
                    n
                )));
            }
            let take = ((self.buf.len() - self.pos) as u64).min(n);
            self.pos += take as usize;
            n -= take;
        }
        Ok(())
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            out.extend_from_slice(&self.buf[self.pos..]);
            self.pos = self.buf.len();
            if self.done || !self.fill().await? {
                return Ok(out);
            }
        }
    }
}

fn read_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::DataTruncated("unexpected end of encrypted stream".into())
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct SinkWriter {
        data: Vec<u8>,
        finished: bool,
    }

    #[async_trait]
    impl BlobWrite for SinkWriter {
        async fn write(&mut self, buf: &[u8]) -> Result<()> {
            self.data.extend_from_slice(buf);
            Ok(())
        }

        async fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    async fn encode(payload: &[u8], passphrase: &str) -> Vec<u8> {
        let mut w = SafeWriter::new(SinkWriter::default(), passphrase)
            .await
            .unwrap();
        w.write(payload).await.unwrap();
        w.finish().await.unwrap();
        assert!(w.get_ref().finished);
        w.get_ref().data.clone()
    }

    #[tokio::test]
    async fn round_trip() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let wire = encode(&payload, "test1234").await;
        // compressible input should actually shrink despite framing overhead
        assert!(wire.len() < payload.len());

        let mut r = SafeReader::new(wire.as_slice(), "test1234").await.unwrap();
        let got = r.read_to_end().await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn empty_stream() {
        let wire = encode(b"", "test1234").await;
        let mut r = SafeReader::new(wire.as_slice(), "test1234").await.unwrap();
        assert_eq!(r.read_to_end().await.unwrap(), b"");
    }

    #[tokio::test]
    async fn skip_and_read_exact() {
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();
        let wire = encode(&payload, "test1234").await;
        let mut r = SafeReader::new(wire.as_slice(), "test1234").await.unwrap();
        r.skip(200_000).await.unwrap();
        let mut buf = [0u8; 16];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &payload[200_000..200_016]);
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_auth() {
        let wire = encode(b"secret data", "test1234").await;
        let mut r = SafeReader::new(wire.as_slice(), "wrong").await.unwrap();
        assert!(matches!(r.read_to_end().await, Err(Error::CodecAuth)));
    }

    #[tokio::test]
    async fn bad_magic_rejected() {
        let mut wire = encode(b"data", "test1234").await;
        wire[0] ^= 0xff;
        assert!(matches!(
            SafeReader::new(wire.as_slice(), "test1234").await,
            Err(Error::CodecAuth)
        ));
    }

    #[tokio::test]
    async fn truncated_stream_detected() {
        let wire = encode(b"some data that matters", "test1234").await;
        // strip the end-of-stream marker
        let cut = &wire[..wire.len() - 4];
        let mut r = SafeReader::new(cut, "test1234").await.unwrap();
        assert!(matches!(
            r.read_to_end().await,
            Err(Error::DataTruncated(_))
        ));

        // cut into the middle of a frame
        let cut = &wire[..wire.len() - 12];
        let mut r = SafeReader::new(cut, "test1234").await.unwrap();
        assert!(r.read_to_end().await.is_err());
    }

    #[tokio::test]
    async fn tampered_frame_fails_auth() {
        let mut wire = encode(b"bytes worth protecting", "test1234").await;
        let n = wire.len();
        wire[n - 10] ^= 0x01;
        let mut r = SafeReader::new(wire.as_slice(), "test1234").await.unwrap();
        assert!(matches!(r.read_to_end().await, Err(Error::CodecAuth)));
    }
}
